use std::{
    collections::{BTreeMap, btree_map},
    ops::RangeBounds,
    sync::Arc,
};

use crate::storage::chain::VersionChain;

/// Lock-protected body of a container.
///
/// Rows live in an append-only arena; `index` maps each key to its arena slot
/// and keeps keys sorted ascending. Rows are never removed.
pub struct Entries<K, V> {
    rows: Vec<Arc<VersionChain<V>>>,
    index: BTreeMap<K, usize>,
}

impl<K: Ord, V> Entries<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            rows: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&VersionChain<V>> {
        self.index.get(key).map(|i| self.rows[*i].as_ref())
    }

    /// Forward cursor over all rows; `.rev()` walks them in reverse.
    /// Calling it again restarts from the beginning.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.range(..)
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> Iter<'_, K, V> {
        Iter {
            inner: self.index.range(range),
            rows: &self.rows,
        }
    }

    pub(crate) fn row(&self, key: &K) -> Option<Arc<VersionChain<V>>> {
        self.index.get(key).map(|i| self.rows[*i].clone())
    }

    /// Inserts a row for a new key, or hands back the existing one
    pub(crate) fn insert(&mut self, key: K, row: VersionChain<V>) -> Arc<VersionChain<V>> {
        if let Some(existing) = self.row(&key) {
            return existing;
        }
        let row = Arc::new(row);
        self.index.insert(key, self.rows.len());
        self.rows.push(row.clone());
        row
    }
}

/// Cursor over container rows in key order
pub struct Iter<'a, K, V> {
    inner: btree_map::Range<'a, K, usize>,
    rows: &'a [Arc<VersionChain<V>>],
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a VersionChain<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let rows = self.rows;
        self.inner.next().map(|item| Self::map(rows, item))
    }
}

impl<'a, K, V> DoubleEndedIterator for Iter<'a, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let rows = self.rows;
        self.inner.next_back().map(|item| Self::map(rows, item))
    }
}

impl<'a, K, V> Iter<'a, K, V> {
    fn map(
        rows: &'a [Arc<VersionChain<V>>],
        item: (&'a K, &'a usize),
    ) -> <Iter<'a, K, V> as Iterator>::Item {
        let (k, i) = item;
        (k, rows[*i].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use super::Entries;
    use crate::storage::chain::VersionChain;

    fn entries(keys: &[u32]) -> Entries<u32, String> {
        let mut entries = Entries::new();
        for key in keys {
            entries.insert(*key, VersionChain::new());
        }
        entries
    }

    #[test]
    fn test_unique_sorted_keys() {
        let entries = entries(&[7, 3, 9, 3]);
        assert_eq!(entries.len(), 3);
        let keys: Vec<u32> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 7, 9]);
    }

    #[test]
    fn test_reverse_and_restart() {
        let entries = entries(&[5, 1, 4]);
        let mut iter = entries.iter().rev();
        assert_eq!(iter.next().map(|(k, _)| *k), Some(5));
        drop(iter);

        let reverse: Vec<u32> = entries.iter().rev().map(|(k, _)| *k).collect();
        assert_eq!(reverse, vec![5, 4, 1]);
        let forward: Vec<u32> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(forward, vec![1, 4, 5]);
    }

    #[test]
    fn test_range_both_ends() {
        let entries = entries(&[1, 2, 3, 4, 5, 6]);
        let mut iter = entries.range((Bound::Excluded(2), Bound::Included(5)));
        assert_eq!(iter.next().map(|(k, _)| *k), Some(3));
        assert_eq!(iter.next_back().map(|(k, _)| *k), Some(5));
        assert_eq!(iter.next().map(|(k, _)| *k), Some(4));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_insert_returns_existing_row() {
        let mut entries: Entries<u32, String> = Entries::new();
        let first = entries.insert(1, VersionChain::new());
        let again = entries.insert(1, VersionChain::new());
        assert!(std::sync::Arc::ptr_eq(&first, &again));
        assert!(entries.get(&1).is_some());
        assert!(entries.get(&2).is_none());
    }
}
