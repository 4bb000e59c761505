//! Deadline-ordered event scheduler
//!
//! Fires deferred actions (synthesizer note-offs, metronome click releases,
//! audition note-offs) at their deadlines. One tokio task owns the pending
//! list and a single timer; it selects over new commands and timer expiry,
//! so two trigger passes never run concurrently. [`EventScheduler::schedule`]
//! is a plain synchronous call usable from worker threads.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Scheduler errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler task has been shut down
    #[error("event scheduler is not running")]
    NotRunning,
}

/// Deferred side effect
pub type Action = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    deadline: Instant,
    action: Action,
}

enum Command {
    Schedule(Scheduled),
    /// Fire everything now; reply with the number fired
    Flush(Option<oneshot::Sender<usize>>),
    Shutdown,
}

/// Handle to the scheduler task
pub struct EventScheduler {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl std::fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventScheduler")
            .field("pending", &self.pending())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventScheduler {
    /// Spawn the scheduler task on `handle`
    pub fn new(handle: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        handle.spawn(run(rx, Arc::clone(&pending)));
        debug!("Event scheduler started");

        Self {
            tx,
            pending,
            closed: AtomicBool::new(false),
        }
    }

    /// Run `action` at `deadline`
    ///
    /// Events with equal deadlines fire in the order they were scheduled.
    /// A deadline in the past fires on the next trigger pass.
    pub fn schedule<F>(&self, deadline: Instant, action: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::NotRunning);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        let command = Command::Schedule(Scheduled {
            deadline,
            action: Box::new(action),
        });
        self.tx.send(command).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            SchedulerError::NotRunning
        })
    }

    /// Run `action` after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, action: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Instant::now() + delay, action)
    }

    /// Fire every pending event as soon as the task sees this request
    pub fn flush(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::NotRunning);
        }
        self.tx
            .send(Command::Flush(None))
            .map_err(|_| SchedulerError::NotRunning)
    }

    /// Fire every pending event and wait until they ran
    ///
    /// Returns how many events fired.
    pub async fn drain(&self) -> Result<usize, SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::NotRunning);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(Some(done_tx)))
            .map_err(|_| SchedulerError::NotRunning)?;
        done_rx.await.map_err(|_| SchedulerError::NotRunning)
    }

    /// Events scheduled but not fired yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Stop the task; pending events are discarded without firing
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Shutdown);
        }
    }
}

impl Drop for EventScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Far enough out to act as "no timer armed"
fn idle_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, pending: Arc<AtomicUsize>) {
    let mut queue: VecDeque<Scheduled> = VecDeque::new();
    let timer = sleep_until(idle_deadline());
    tokio::pin!(timer);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule(event)) => {
                    let deadline = event.deadline;
                    // Linear insertion after every event with deadline <= new
                    let pos = queue
                        .iter()
                        .position(|e| e.deadline > deadline)
                        .unwrap_or(queue.len());
                    queue.insert(pos, event);
                    if pos == 0 {
                        timer.as_mut().reset(deadline);
                    }
                    trace!("Scheduled event at position {} ({} pending)", pos, queue.len());
                }
                Some(Command::Flush(done)) => {
                    let fired = fire(&mut queue, None, &pending);
                    timer.as_mut().reset(idle_deadline());
                    if fired > 0 {
                        debug!("Flushed {} scheduled events", fired);
                    }
                    if let Some(done) = done {
                        let _ = done.send(fired);
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            () = &mut timer => {
                fire(&mut queue, Some(Instant::now()), &pending);
                let next = queue.front().map(|e| e.deadline).unwrap_or_else(idle_deadline);
                timer.as_mut().reset(next);
            }
        }
    }

    let discarded = queue.len();
    pending.store(0, Ordering::Release);
    debug!("Event scheduler stopped ({} pending events discarded)", discarded);
}

/// Fire events in deadline order up to `now` (or all of them)
fn fire(queue: &mut VecDeque<Scheduled>, now: Option<Instant>, pending: &AtomicUsize) -> usize {
    let mut fired = 0;
    while let Some(front) = queue.front() {
        if matches!(now, Some(now) if front.deadline > now) {
            break;
        }
        let Some(event) = queue.pop_front() else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(event.action)).is_err() {
            warn!("Scheduled action panicked");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
        fired += 1;
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |n: u32| -> Action {
                let log = Arc::clone(&log);
                Box::new(move || log.lock().unwrap().push(n))
            }
        };
        (log, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();
        let start = Instant::now();

        scheduler.schedule(start + Duration::from_millis(30), make(30)).unwrap();
        scheduler.schedule(start + Duration::from_millis(10), make(10)).unwrap();
        scheduler.schedule(start + Duration::from_millis(20), make(20)).unwrap();
        assert_eq!(scheduler.pending(), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_deadlines_are_fifo() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();
        let deadline = Instant::now() + Duration::from_millis(5);

        for n in 0..5 {
            scheduler.schedule(deadline, make(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_earliest_event_reprograms_timer() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();

        scheduler.schedule_after(Duration::from_secs(1), make(1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.schedule_after(Duration::from_millis(10), make(10)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec![10]);
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*log.lock().unwrap(), vec![10, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_fires_everything_now() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();

        scheduler.schedule_after(Duration::from_secs(5), make(2)).unwrap();
        scheduler.schedule_after(Duration::from_secs(3), make(1)).unwrap();

        assert_eq!(scheduler.drain().await, Ok(2));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_does_not_kill_scheduler() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();

        scheduler
            .schedule_after(Duration::from_millis(1), || panic!("boom"))
            .unwrap();
        scheduler.schedule_after(Duration::from_millis(2), make(7)).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_events() {
        let scheduler = EventScheduler::new(&Handle::current());
        let (log, make) = recorder();
        scheduler.schedule_after(Duration::from_millis(5), make(1)).unwrap();

        scheduler.shutdown();
        assert_eq!(
            scheduler.schedule_after(Duration::ZERO, make(2)),
            Err(SchedulerError::NotRunning)
        );
        assert_eq!(scheduler.flush(), Err(SchedulerError::NotRunning));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(log.lock().unwrap().is_empty());
        assert!(!scheduler.is_running());
    }
}
