//! Index-arena LRU used for chunk residency
//!
//! Entries live in a `Vec` of slots; recency order is a doubly-linked list
//! threaded through the slots by index, freed slots go on a free list, and
//! a `HashMap` maps keys to slots. Touch, insert and evict are O(1).

use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot<V> {
    key: u64,
    value: V,
    prev: usize,
    next: usize,
}

/// Capacity-bounded LRU map keyed by `u64`
///
/// The head is the most recently touched entry; eviction takes the tail.
#[derive(Debug)]
pub struct LruArena<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<V> LruArena<V> {
    /// Create an empty LRU holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: u64) -> bool {
        self.index.contains_key(&key)
    }

    /// Look up without changing recency
    pub fn peek(&self, key: u64) -> Option<&V> {
        let idx = *self.index.get(&key)?;
        self.slots[idx].as_ref().map(|slot| &slot.value)
    }

    /// Move `key` to the head; returns false if absent
    pub fn touch(&mut self, key: u64) -> bool {
        let Some(&idx) = self.index.get(&key) else {
            return false;
        };
        if idx != self.head {
            self.unlink(idx);
            self.push_front(idx);
        }
        true
    }

    /// Insert or replace `key` as the most recent entry
    ///
    /// Returns the evicted tail entry when the insert overflowed capacity.
    pub fn insert(&mut self, key: u64, value: V) -> Option<(u64, V)> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.value = value;
            }
            self.touch(key);
            return None;
        }

        let evicted = if self.len() >= self.capacity {
            self.pop_back()
        } else {
            None
        };

        let slot = Slot {
            key,
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        let idx = self.index.remove(&key)?;
        self.unlink(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|slot| slot.value)
    }

    /// Remove and return the least recently touched entry
    pub fn pop_back(&mut self) -> Option<(u64, V)> {
        if self.tail == NIL {
            return None;
        }
        let idx = self.tail;
        self.unlink(idx);
        self.free.push(idx);
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.key);
        Some((slot.key, slot.value))
    }

    /// Keys from most to least recently touched
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            match self.slots[cursor].as_ref() {
                Some(slot) => {
                    keys.push(slot.key);
                    cursor = slot.next;
                }
                None => break,
            }
        }
        keys
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };

        if prev == NIL {
            self.head = next;
        } else if let Some(p) = self.slots[prev].as_mut() {
            p.next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else if let Some(n) = self.slots[next].as_mut() {
            n.prev = prev;
        }

        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = NIL;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.slots[old_head].as_mut() {
                h.prev = idx;
            }
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_past_capacity_evicts_tail() {
        let mut lru = LruArena::new(3);
        assert!(lru.insert(1, "a").is_none());
        assert!(lru.insert(2, "b").is_none());
        assert!(lru.insert(3, "c").is_none());
        assert_eq!(lru.insert(4, "d"), Some((1, "a")));
        assert_eq!(lru.keys(), vec![4, 3, 2]);
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn test_touch_changes_order_not_residency() {
        let mut lru = LruArena::new(3);
        for key in 1..=3 {
            lru.insert(key, key * 10);
        }
        assert!(lru.touch(1));
        assert_eq!(lru.keys(), vec![1, 3, 2]);

        // Head touch is a no-op
        assert!(lru.touch(1));
        assert_eq!(lru.keys(), vec![1, 3, 2]);
        assert!(!lru.touch(99));

        assert_eq!(lru.insert(4, 40), Some((2, 20)));
        assert_eq!(lru.keys(), vec![4, 1, 3]);
    }

    #[test]
    fn test_free_list_reuses_slots() {
        let mut lru = LruArena::new(2);
        for key in 0..100 {
            lru.insert(key, ());
        }
        assert_eq!(lru.slots.len(), 2);
        assert_eq!(lru.keys(), vec![99, 98]);
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let mut lru = LruArena::new(4);
        for key in 1..=4 {
            lru.insert(key, key);
        }
        assert_eq!(lru.remove(3), Some(3));
        assert_eq!(lru.keys(), vec![4, 2, 1]);
        assert_eq!(lru.remove(1), Some(1));
        assert_eq!(lru.pop_back(), Some((2, 2)));
        assert_eq!(lru.keys(), vec![4]);
        assert_eq!(lru.remove(4), Some(4));
        assert!(lru.is_empty());
        assert_eq!(lru.pop_back(), None);
    }

    #[test]
    fn test_reinsert_replaces_value_and_promotes() {
        let mut lru = LruArena::new(2);
        lru.insert(1, "old");
        lru.insert(2, "x");
        assert!(lru.insert(1, "new").is_none());
        assert_eq!(lru.peek(1), Some(&"new"));
        assert_eq!(lru.keys(), vec![1, 2]);
    }

    #[test]
    fn test_resident_set_is_most_recent_n() {
        let capacity = 8;
        let mut lru = LruArena::new(capacity);
        let mut seed: u32 = 42;
        let mut recent: Vec<u64> = Vec::new();

        for _ in 0..1_000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let key = ((seed >> 16) % 20) as u64;
            if lru.contains(key) {
                lru.touch(key);
            } else {
                lru.insert(key, ());
            }
            recent.retain(|k| *k != key);
            recent.insert(0, key);
            recent.truncate(capacity);
            assert_eq!(lru.keys(), recent);
        }
    }
}
