//! Chunk cache behaviour across the writer, fetch worker and readers

mod helpers;

use cadenza_play::cache::{encode_samples, CacheError, ChunkCache};
use cadenza_play::config::CacheConfig;
use helpers::{small_cache, wait_until};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// 512 samples per chunk with the test block size
const CHUNK_SAMPLES: usize = 512;

fn ramp(len: usize, from: usize) -> Vec<i16> {
    (from..from + len).map(|i| (i % 30_000) as i16).collect()
}

#[test]
fn test_chunk_resolves_only_once_fully_written() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(ChunkCache::create(dir.path().join("stream.raw"), small_cache()).unwrap());

    let (tx, rx) = crossbeam_channel::unbounded::<Vec<i16>>();
    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.write(&mut rx.into_iter()))
    };

    // Three and a half chunks on disk
    for i in 0..7 {
        tx.send(ramp(256, i * 256)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || cache.bytes_written() == 3_584));

    let chunk = cache.wait(2).unwrap().unwrap();
    assert_eq!(chunk.first_sample(), 2 * CHUNK_SAMPLES as u64);
    assert_eq!(chunk.samples(), &ramp(CHUNK_SAMPLES, 2 * CHUNK_SAMPLES)[..]);
    assert!(matches!(
        cache.wait_timeout(3, Duration::from_millis(50)),
        Err(CacheError::Timeout { id: 3 })
    ));

    // A reader already waiting is woken by the write that completes the chunk
    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.wait(3))
    };
    thread::sleep(Duration::from_millis(20));
    tx.send(ramp(256, 7 * 256)).unwrap();
    let chunk = reader.join().unwrap().unwrap().unwrap();
    assert_eq!(chunk.len(), CHUNK_SAMPLES);
    assert_eq!(chunk.sample_at(3 * CHUNK_SAMPLES as u64), Some(1_536));

    // A short tail chunk, then end of stream
    tx.send(ramp(100, 8 * 256)).unwrap();
    drop(tx);
    assert_eq!(writer.join().unwrap().unwrap(), 2_148);

    assert!(cache.is_complete());
    assert_eq!(cache.bytes_written(), -1);
    assert_eq!(cache.total_samples(), Some(2_148));
    assert_eq!(cache.end_of_stream(), Some((4, 200)));
    assert_eq!(cache.wait(4).unwrap().map(|c| c.len()), Some(100));
    assert!(cache.wait(5).unwrap().is_none());
    assert!(cache.wait(40).unwrap().is_none());
}

#[test]
fn test_resident_set_follows_recency() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("complete.raw");
    std::fs::write(&path, encode_samples(&ramp(CHUNK_SAMPLES * 10, 0))).unwrap();
    let config = CacheConfig {
        max_chunks: 4,
        ..small_cache()
    };
    let cache = ChunkCache::open(&path, config).unwrap();

    for id in 0..10 {
        assert!(cache.wait(id).unwrap().is_some());
    }
    assert_eq!(cache.resident_ids(), vec![9, 8, 7, 6]);
    assert_eq!(cache.stats().evictions, 6);

    // A hit through get() promotes once the fetch worker sees the request
    assert!(cache.get(6).is_some());
    assert!(wait_until(Duration::from_secs(5), || cache.resident_ids()[0] == 6));

    cache.wait(2).unwrap().unwrap();
    assert_eq!(cache.resident_ids(), vec![2, 6, 9, 8]);
    assert!(cache.get(7).is_none());

    let stats = cache.stats();
    assert_eq!(stats.resident_chunks, 4);
    assert!(stats.hits >= 1);
    assert!(stats.misses >= 1);
}

#[test]
fn test_requests_past_end_do_not_evict_resident_chunks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.raw");
    std::fs::write(&path, encode_samples(&ramp(CHUNK_SAMPLES * 2, 0))).unwrap();
    let config = CacheConfig {
        max_chunks: 2,
        ..small_cache()
    };
    let cache = ChunkCache::open(&path, config).unwrap();

    cache.wait(0).unwrap().unwrap();
    cache.wait(1).unwrap().unwrap();
    for id in 2..12 {
        assert!(cache.get(id).is_none());
    }
    assert!(wait_until(Duration::from_secs(5), || cache.stats().absent_markers == 10));

    assert_eq!(cache.resident_ids(), vec![1, 0]);
    let stats = cache.stats();
    assert_eq!(stats.resident_chunks, 2);
    assert_eq!(stats.evictions, 0);
    assert!(cache.wait(11).unwrap().is_none());
}

#[test]
fn test_unreadable_chunk_fails_after_retries_until_forgotten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vanishing.raw");
    let samples = ramp(CHUNK_SAMPLES * 2, 0);
    std::fs::write(&path, encode_samples(&samples)).unwrap();
    let cache = ChunkCache::open(&path, small_cache()).unwrap();
    std::fs::remove_file(&path).unwrap();

    let attempts = small_cache().max_read_attempts;
    assert!(matches!(cache.wait(0), Err(CacheError::ReadFailed { id: 0, .. })));
    let stats = cache.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.retries, u64::from(attempts - 1));

    // Failed stays failed until cleared
    assert!(matches!(cache.wait(0), Err(CacheError::ReadFailed { .. })));

    std::fs::write(&path, encode_samples(&samples)).unwrap();
    assert!(cache.forget_failure(0));
    assert!(!cache.forget_failure(0));
    let chunk = cache.wait(0).unwrap().unwrap();
    assert_eq!(chunk.samples(), &samples[..CHUNK_SAMPLES]);
}

#[test]
fn test_listeners_see_chunks_as_they_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("listened.raw");
    std::fs::write(&path, encode_samples(&ramp(CHUNK_SAMPLES * 3, 0))).unwrap();
    let cache = ChunkCache::open(&path, small_cache()).unwrap();

    let listener = cache.subscribe(8);
    assert_eq!(cache.stats().listeners, 1);
    for id in [1, 0, 2] {
        cache.wait(id).unwrap().unwrap();
    }

    let ids: Vec<u64> = (0..3)
        .filter_map(|_| listener.recv_timeout(Duration::from_secs(1)))
        .map(|chunk| chunk.id())
        .collect();
    assert_eq!(ids, vec![1, 0, 2]);

    // Resident chunks are not re-broadcast
    cache.wait(1).unwrap().unwrap();
    assert!(listener.recv_timeout(Duration::from_millis(30)).is_none());

    assert!(cache.unsubscribe(listener.id()));
    assert_eq!(cache.stats().listeners, 0);
}
