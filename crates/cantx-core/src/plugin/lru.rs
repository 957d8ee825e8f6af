//! Bounded least-recently-used map
//!
//! Entries live in a slot arena; recency is an intrusive doubly linked list
//! threaded through the slots (head = most recent). Freed slots are reused.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Fixed-capacity LRU cache
#[derive(Debug)]
pub struct LruCache<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Mark `key` as most recently used; false when absent
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.unlink(slot);
                self.push_front(slot);
                true
            }
            None => false,
        }
    }

    /// Touch and borrow the value
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.unlink(slot);
        self.push_front(slot);
        self.slots[slot].as_mut().map(|s| &mut s.value)
    }

    /// Borrow without changing recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|s| &s.value)
    }

    /// Insert or replace `key` as most recent.
    ///
    /// Returns the entry evicted to stay within capacity, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(s) = self.slots[slot].as_mut() {
                s.value = value;
            }
            self.unlink(slot);
            self.push_front(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let entry = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(entry);
                i
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.slots[slot].take().map(|s| s.value)
    }

    /// Drop the least recently touched entry
    pub fn evict_oldest(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        self.free.push(slot);
        let entry = self.slots[slot].take()?;
        self.index.remove(&entry.key);
        Some((entry.key, entry.value))
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cur = self.head;
        while cur != NIL {
            match self.slots[cur].as_ref() {
                Some(s) => {
                    keys.push(s.key.clone());
                    cur = s.next;
                }
                None => break,
            }
        }
        keys
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn links(&self, slot: usize) -> (usize, usize) {
        self.slots[slot]
            .as_ref()
            .map(|s| (s.prev, s.next))
            .unwrap_or((NIL, NIL))
    }

    fn set_prev(&mut self, slot: usize, prev: usize) {
        if let Some(s) = self.slots[slot].as_mut() {
            s.prev = prev;
        }
    }

    fn set_next(&mut self, slot: usize, next: usize) {
        if let Some(s) = self.slots[slot].as_mut() {
            s.next = next;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = self.links(slot);
        if prev == NIL {
            if self.head == slot {
                self.head = next;
            }
        } else {
            self.set_next(prev, next);
        }
        if next == NIL {
            if self.tail == slot {
                self.tail = prev;
            }
        } else {
            self.set_prev(next, prev);
        }
        self.set_prev(slot, NIL);
        self.set_next(slot, NIL);
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        self.set_prev(slot, NIL);
        self.set_next(slot, old_head);
        if old_head != NIL {
            self.set_prev(old_head, slot);
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}
