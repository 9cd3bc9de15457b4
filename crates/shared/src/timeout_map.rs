//! A keyed map whose entries expire at a per-entry deadline.
//!
//! Backs the auction deadline wheel and the post-auction join store. Expiry
//! fires in deadline order, with insertion order as the tie break, so that a
//! batch of entries sharing one deadline drains deterministically.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

struct Slot<V> {
    value: V,
    deadline: DateTime<Utc>,
    seq: u64,
}

pub struct TimeoutMap<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Deadline wheel; `seq` disambiguates equal deadlines.
    wheel: BTreeMap<(DateTime<Utc>, u64), K>,
    next_seq: u64,
    capacity: Option<usize>,
}

impl<K: Clone + Eq + Hash, V> Default for TimeoutMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash, V> TimeoutMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            wheel: BTreeMap::new(),
            next_seq: 0,
            capacity: None,
        }
    }

    /// Bounds the map; inserting past the bound evicts the entry that has
    /// been resident longest.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Inserts or replaces an entry. Returns the entry evicted to make room,
    /// if the map is bounded and was full.
    pub fn insert(&mut self, key: K, value: V, deadline: DateTime<Utc>) -> Option<(K, V)> {
        self.remove(&key);

        let evicted = match self.capacity {
            Some(capacity) if self.entries.len() >= capacity => self.pop_oldest(),
            _ => None,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.wheel.insert((deadline, seq), key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                deadline,
                seq,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.wheel.remove(&(slot.deadline, slot.seq));
        Some(slot.value)
    }

    /// The earliest deadline currently in the map.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.wheel.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry whose deadline is `<= now`, in
    /// (deadline, insertion) order.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<(K, V)> {
        let mut expired = Vec::new();
        while let Some((&(deadline, seq), _)) = self.wheel.iter().next() {
            if deadline > now {
                break;
            }
            let key = self.wheel.remove(&(deadline, seq)).unwrap();
            let slot = self.entries.remove(&key).unwrap();
            expired.push((key, slot.value));
        }
        expired
    }

    /// Removes the entry with the smallest insertion sequence, i.e. the one
    /// resident longest.
    fn pop_oldest(&mut self) -> Option<(K, V)> {
        let key = self
            .wheel
            .iter()
            .min_by_key(|((_, seq), _)| *seq)
            .map(|(_, key)| key.clone())?;
        let slot = self.entries.remove(&key)?;
        self.wheel.remove(&(slot.deadline, slot.seq));
        Some((key, slot.value))
    }
}
