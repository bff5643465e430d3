//! Bounded key/value stores usable from probe context.
//!
//! [`LruHashMap`] mirrors the semantics of a `BPF_MAP_TYPE_LRU_HASH`:
//! - capacity is fixed when the map is created and memory never grows past it
//! - every operation completes in bounded time
//! - inserting into a full map evicts the least recently used entry
//! - each operation is atomic with respect to other threads, but no lock is
//!   ever held across two operations
//!
//! Lookups count as a use, so hot entries survive eviction.

use std::{collections::HashMap, hash::Hash};

use parking_lot::Mutex;

const NIL: usize = usize::MAX;

pub struct LruHashMap<K, V> {
    name: &'static str,
    max_entries: usize,
    inner: Mutex<Lru<K, V>>,
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Slab of nodes linked in recency order. `head` is the most recently used.
struct Lru<K, V> {
    index: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K, V> LruHashMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a map holding at most `max_entries` elements.
    /// A zero capacity is bumped to one, as the kernel refuses empty maps.
    pub fn with_max_entries(name: &'static str, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            name,
            max_entries,
            inner: Mutex::new(Lru {
                index: HashMap::with_capacity(max_entries),
                nodes: Vec::with_capacity(max_entries),
                free: Vec::with_capacity(max_entries),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check for presence without refreshing the entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    /// Read the stored value without refreshing the entry.
    pub fn peek<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        let lru = self.inner.lock();
        let idx = *lru.index.get(key)?;
        lru.nodes[idx].as_ref().map(|node| f(&node.value))
    }

    /// Return a copy of the value and mark the entry as recently used.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.update(key, |value| value.clone())
    }

    /// Run `f` on the stored value in place. The closure runs under the map
    /// lock, so it must be short and must not touch this map again.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut lru = self.inner.lock();
        let idx = *lru.index.get(key)?;
        lru.touch(idx);
        lru.nodes[idx].as_mut().map(|node| f(&mut node.value))
    }

    /// Insert or overwrite the value for `key`, returning the previous value
    /// stored under the same key. When the map is full the least recently
    /// used entry is evicted to make room.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut lru = self.inner.lock();
        if let Some(&idx) = lru.index.get(&key) {
            lru.touch(idx);
            return lru.nodes[idx]
                .as_mut()
                .map(|node| std::mem::replace(&mut node.value, value));
        }
        if lru.index.len() >= self.max_entries {
            let tail = lru.tail;
            if lru.take(tail).is_some() {
                log::trace!("{}: evicted least recently used entry", self.name);
            }
        }
        lru.push_front(key, value);
        None
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut lru = self.inner.lock();
        let idx = *lru.index.get(key)?;
        lru.take(idx)
    }

    pub fn clear(&self) {
        let mut lru = self.inner.lock();
        lru.index.clear();
        lru.nodes.clear();
        lru.free.clear();
        lru.head = NIL;
        lru.tail = NIL;
    }
}

impl<K, V> Lru<K, V>
where
    K: Hash + Eq + Clone,
{
    fn push_front(&mut self, key: K, value: V) {
        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.link_front(idx);
        self.index.insert(key, idx);
    }

    /// Move an occupied slot to the front of the recency list.
    fn touch(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Remove an occupied slot, returning its value.
    fn take(&mut self, idx: usize) -> Option<V> {
        if self.nodes.get(idx).is_none_or(Option::is_none) {
            return None;
        }
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node.value)
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        match self.nodes.get_mut(old_head).and_then(Option::as_mut) {
            Some(head) => head.prev = idx,
            None => self.tail = idx,
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.nodes[idx].as_ref().map(|n| (n.prev, n.next)) else {
            return;
        };
        match self.nodes.get_mut(prev).and_then(Option::as_mut) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
        match self.nodes.get_mut(next).and_then(Option::as_mut) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
    }
}
