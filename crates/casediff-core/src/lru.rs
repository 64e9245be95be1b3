//! A capacity-bounded map that evicts least-recently-used entries.
//!
//! Every successful read or write marks the key as most recently used.
//! The type intentionally implements neither `Clone` nor `FromIterator`:
//! neither operation can carry the access order across cheaply, so callers
//! must not rely on them.

use std::{
  borrow::Borrow,
  collections::{BTreeMap, HashMap},
  hash::Hash,
};

struct Entry<V> {
  value: V,
  tick:  u64,
}

pub struct LruCache<K, V> {
  capacity: usize,
  tick:     u64,
  entries:  HashMap<K, Entry<V>>,
  /// Access tick -> key, oldest first.
  order:    BTreeMap<u64, K>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "LRU capacity must be positive");
    Self {
      capacity,
      tick: 0,
      entries: HashMap::new(),
      order: BTreeMap::new(),
    }
  }

  pub fn capacity(&self) -> usize { self.capacity }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// Membership test; does not affect recency.
  pub fn contains_key<Q>(&self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.entries.contains_key(key)
  }

  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  fn mark<Q>(&mut self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    let tick = self.next_tick();
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    if let Some(k) = self.order.remove(&entry.tick) {
      self.order.insert(tick, k);
    }
    entry.tick = tick;
    true
  }

  /// Look up `key`, marking it most recently used.
  pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    if !self.mark(key) {
      return None;
    }
    self.entries.get(key).map(|e| &e.value)
  }

  pub fn get_or<'a, Q>(&'a mut self, key: &Q, default: &'a V) -> &'a V
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.get(key).unwrap_or(default)
  }

  /// Mark `key` as recently used without reading it. Returns whether the key
  /// was present.
  pub fn touch<Q>(&mut self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.mark(key)
  }

  /// Insert or replace `key`, then evict the oldest entries while over
  /// capacity.
  pub fn set(&mut self, key: K, value: V) {
    let tick = self.next_tick();
    if let Some(old) = self.entries.insert(key.clone(), Entry { value, tick }) {
      self.order.remove(&old.tick);
    }
    self.order.insert(tick, key);
    while self.entries.len() > self.capacity {
      let Some((_, oldest)) = self.order.pop_first() else {
        break;
      };
      self.entries.remove(&oldest);
    }
  }

  pub fn pop<Q>(&mut self, key: &Q) -> Option<V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    let entry = self.entries.remove(key)?;
    self.order.remove(&entry.tick);
    Some(entry.value)
  }

  pub fn pop_or<Q>(&mut self, key: &Q, default: V) -> V
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.pop(key).unwrap_or(default)
  }

  /// Keys from least to most recently used.
  pub fn keys(&self) -> impl Iterator<Item = &K> + '_ { self.order.values() }
}
