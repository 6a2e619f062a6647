//! Ordered byte-keyed collections with O(1) snapshots.
//!
//! `im::OrdMap` clones are constant-time and structurally shared, so taking
//! a snapshot is just cloning the collection map. Snapshots are immutable
//! and safe to read from any thread while the head keeps mutating.

use compact_str::CompactString;
use im::OrdMap;
use std::ops::Bound;

pub type Bytes = Vec<u8>;

/// One named, sorted key-value collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemCollection {
    items: OrdMap<Bytes, Bytes>,
}

impl MemCollection {
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.items.get(key)
    }

    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.items.insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.items.remove(key);
    }

    pub fn min_item(&self) -> Option<(&Bytes, &Bytes)> {
        self.items.get_min().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.items.iter()
    }

    /// Ascending iteration over `[start, end)`; an unbounded end scans to
    /// the end of the collection. The iterator borrows only the
    /// collection, not the bound slices.
    pub fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a Bytes, &'a Bytes)> + use<'a> {
        let lower = Bound::Included(start.to_vec());
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        self.items.range((lower, upper))
    }

    /// Ascending iteration from `start` (inclusive) to the end.
    pub fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> impl Iterator<Item = (&'a Bytes, &'a Bytes)> + use<'a> {
        self.iter_range(start, None)
    }
}

/// The mutable head store: a sorted map of named collections.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    collections: OrdMap<CompactString, MemCollection>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn get_collection(&self, name: &str) -> Option<&MemCollection> {
        self.collections.get(name)
    }

    /// Returns the named collection, creating it when absent.
    pub fn mutable(&mut self, name: &str) -> &mut MemCollection {
        if !self.collections.contains_key(name) {
            self.collections
                .insert(CompactString::from(name), MemCollection::default());
        }
        self.collections
            .get_mut(name)
            .expect("collection inserted above")
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CompactString> {
        self.collections.keys()
    }

    /// O(1) copy-on-write snapshot. Mutations to the head after this call
    /// are invisible through the snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            collections: self.collections.clone(),
        }
    }
}

/// Immutable view of a `MemStore` at a point in time. Cloning is O(1);
/// snapshots may be shared freely across threads.
#[derive(Debug, Clone)]
pub struct Snapshot {
    collections: OrdMap<CompactString, MemCollection>,
}

impl Snapshot {
    pub fn get_collection(&self, name: &str) -> Option<&MemCollection> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CompactString> {
        self.collections.keys()
    }
}

/// Read-side seam shared by the mutable head and frozen snapshots, so
/// index lookup and query execution run against either.
pub trait StoreView {
    fn view_collection(&self, name: &str) -> Option<&MemCollection>;
    fn view_collection_names(&self) -> Vec<CompactString>;
}

impl StoreView for MemStore {
    fn view_collection(&self, name: &str) -> Option<&MemCollection> {
        self.get_collection(name)
    }

    fn view_collection_names(&self) -> Vec<CompactString> {
        self.collection_names().cloned().collect()
    }
}

impl StoreView for Snapshot {
    fn view_collection(&self, name: &str) -> Option<&MemCollection> {
        self.get_collection(name)
    }

    fn view_collection_names(&self) -> Vec<CompactString> {
        self.collection_names().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_collection_ops() {
        let mut store = MemStore::new();
        let coll = store.mutable("ents:");
        coll.set(vec![2], vec![20]);
        coll.set(vec![1], vec![10]);
        coll.set(vec![3], vec![30]);
        assert_eq!(coll.get(&[2]), Some(&vec![20]));
        assert_eq!(coll.min_item(), Some((&vec![1], &vec![10])));

        coll.delete(&[2]);
        assert_eq!(coll.get(&[2]), None);
        assert_eq!(coll.len(), 2);

        let keys: Vec<_> = coll.iter_from(&[1]).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![vec![1], vec![3]]);
    }

    #[test]
    fn range_is_half_open() {
        let mut store = MemStore::new();
        let coll = store.mutable("c");
        for i in 0u8..5 {
            coll.set(vec![i], vec![]);
        }
        let keys: Vec<_> = coll
            .iter_range(&[1], Some(&[4]))
            .map(|(k, _)| k.clone())
            .collect();
        assert_eq!(keys, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn snapshots_do_not_observe_later_writes() {
        let mut store = MemStore::new();
        store.mutable("c").set(vec![1], vec![1]);

        let snap = store.snapshot();
        store.mutable("c").set(vec![1], vec![99]);
        store.mutable("c").set(vec![2], vec![2]);
        store.mutable("new").set(vec![0], vec![0]);

        let frozen = snap.get_collection("c").unwrap();
        assert_eq!(frozen.get(&[1]), Some(&vec![1]));
        assert_eq!(frozen.get(&[2]), None);
        assert!(snap.get_collection("new").is_none());

        // repeated reads through the snapshot stay deterministic
        assert_eq!(frozen.get(&[1]), Some(&vec![1]));
    }

    #[test]
    fn snapshot_of_snapshot_state_is_shared() {
        let mut store = MemStore::new();
        for i in 0u8..100 {
            store.mutable("c").set(vec![i], vec![i]);
        }
        let s1 = store.snapshot();
        let s2 = store.snapshot();
        assert_eq!(
            s1.get_collection("c").unwrap().len(),
            s2.get_collection("c").unwrap().len()
        );
    }
}
