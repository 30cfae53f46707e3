//! In-memory ordered store.
//!
//! The map lives behind an `Arc` that writers clone-on-write, so a cursor
//! keeps reading the snapshot taken when it was opened while writes proceed.

use crate::error::StoreError;
use crate::store::{Cursor, Store};
use bytes::Bytes;
use manykv_protocol::{BatchOp, RangeOptions};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::sync::Arc;

type Map = BTreeMap<Bytes, Bytes>;

/// A [`Store`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Arc<Map>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn get_many(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let data = self.data.read();
        Ok(keys.iter().map(|key| data.get(key).cloned()).collect())
    }

    fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError> {
        let mut data = self.data.write();
        Arc::make_mut(&mut data).insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data.contains_key(key) {
            Arc::make_mut(&mut data).remove(key);
        }
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let map = Arc::make_mut(&mut data);
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self, range: &RangeOptions) -> Result<(), StoreError> {
        let limit = range
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let lower = owned(range.lower_bound());
        let upper = owned(range.upper_bound());

        let mut data = self.data.write();
        let doomed = collect_range(&data, &lower, &upper, range.reverse, limit);
        if doomed.is_empty() {
            return Ok(());
        }

        let map = Arc::make_mut(&mut data);
        for (key, _) in doomed {
            map.remove(&key);
        }
        tracing::trace!(remaining = map.len(), "Cleared range");
        Ok(())
    }

    fn iterator(&self, range: &RangeOptions) -> Result<Box<dyn Cursor>, StoreError> {
        Ok(Box::new(MemoryCursor {
            data: Some(self.data.read().clone()),
            lower: owned(range.lower_bound()),
            upper: owned(range.upper_bound()),
            reverse: range.reverse,
            position: Unbounded,
        }))
    }
}

struct MemoryCursor {
    /// `None` once closed.
    data: Option<Arc<Map>>,
    lower: Bound<Bytes>,
    upper: Bound<Bytes>,
    reverse: bool,
    /// Where the next read starts: a lower bound walking forward, an upper
    /// bound walking in reverse.
    position: Bound<Bytes>,
}

impl Cursor for MemoryCursor {
    fn next_batch(&mut self, n: usize) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let data = self.data.as_ref().ok_or(StoreError::CursorClosed)?;

        let (lower, upper) = if self.reverse {
            (self.lower.clone(), tighter_upper(&self.upper, &self.position))
        } else {
            (tighter_lower(&self.lower, &self.position), self.upper.clone())
        };

        let batch = collect_range(data, &lower, &upper, self.reverse, n);
        if let Some((key, _)) = batch.last() {
            self.position = Excluded(key.clone());
        }
        Ok(batch)
    }

    fn seek(&mut self, target: &[u8]) {
        self.position = Included(Bytes::copy_from_slice(target));
    }

    fn close(&mut self) {
        self.data = None;
    }
}

fn owned(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Included(key) => Included(Bytes::copy_from_slice(key)),
        Excluded(key) => Excluded(Bytes::copy_from_slice(key)),
        Unbounded => Unbounded,
    }
}

fn borrowed(bound: &Bound<Bytes>) -> Bound<&[u8]> {
    match bound {
        Included(key) => Included(key.as_ref()),
        Excluded(key) => Excluded(key.as_ref()),
        Unbounded => Unbounded,
    }
}

fn tighter_lower(a: &Bound<Bytes>, b: &Bound<Bytes>) -> Bound<Bytes> {
    match (a, b) {
        (Unbounded, other) | (other, Unbounded) => other.clone(),
        (Included(x) | Excluded(x), Included(y) | Excluded(y)) => {
            if x > y || (x == y && matches!(a, Excluded(_))) {
                a.clone()
            } else {
                b.clone()
            }
        }
    }
}

fn tighter_upper(a: &Bound<Bytes>, b: &Bound<Bytes>) -> Bound<Bytes> {
    match (a, b) {
        (Unbounded, other) | (other, Unbounded) => other.clone(),
        (Included(x) | Excluded(x), Included(y) | Excluded(y)) => {
            if x < y || (x == y && matches!(a, Excluded(_))) {
                a.clone()
            } else {
                b.clone()
            }
        }
    }
}

/// `BTreeMap::range` panics on inverted bounds, so those are caught here.
fn is_empty_range(lower: &Bound<Bytes>, upper: &Bound<Bytes>) -> bool {
    match (lower, upper) {
        (Included(lo), Included(hi)) => lo > hi,
        (Included(lo) | Excluded(lo), Included(hi) | Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

fn collect_range(
    map: &Map,
    lower: &Bound<Bytes>,
    upper: &Bound<Bytes>,
    reverse: bool,
    n: usize,
) -> Vec<(Bytes, Bytes)> {
    if n == 0 || is_empty_range(lower, upper) {
        return Vec::new();
    }

    let range = map.range::<[u8], _>((borrowed(lower), borrowed(upper)));
    let pairs = |(k, v): (&Bytes, &Bytes)| (k.clone(), v.clone());
    if reverse {
        range.rev().take(n).map(pairs).collect()
    } else {
        range.take(n).map(pairs).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for key in keys {
            store
                .put(Bytes::copy_from_slice(key.as_bytes()), Bytes::from(format!("v{key}")))
                .unwrap();
        }
        store
    }

    fn keys(batch: &[(Bytes, Bytes)]) -> Vec<&[u8]> {
        batch.iter().map(|(k, _)| k.as_ref()).collect()
    }

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("hello".into(), "world".into()).unwrap();
        assert_eq!(store.get(b"hello").unwrap(), Some(Bytes::from("world")));

        store.delete(b"hello").unwrap();
        assert_eq!(store.get(b"hello").unwrap(), None);
        assert!(store.is_empty());

        // Deleting a missing key is not an error
        store.delete(b"missing").unwrap();
    }

    #[test]
    fn test_get_many_keeps_order() {
        let store = store_with(&["a", "c"]);
        let values = store
            .get_many(&[Bytes::from("c"), Bytes::from("b"), Bytes::from("a")])
            .unwrap();
        assert_eq!(
            values,
            vec![Some(Bytes::from("vc")), None, Some(Bytes::from("va"))]
        );
    }

    #[test]
    fn test_batch() {
        let store = store_with(&["a", "b"]);
        store
            .batch(vec![BatchOp::del("a"), BatchOp::put("c", "3"), BatchOp::put("b", "2")])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some("2".into()));
        assert_eq!(store.get(b"c").unwrap(), Some("3".into()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_cursor_forward_in_batches() {
        let store = store_with(&["a", "b", "c", "d", "e"]);
        let mut cursor = store
            .iterator(&RangeOptions::new().with_gt("a").with_lte("d"))
            .unwrap();

        assert_eq!(keys(&cursor.next_batch(2).unwrap()), vec![b"b", b"c"]);
        assert_eq!(keys(&cursor.next_batch(2).unwrap()), vec![b"d"]);
        assert!(cursor.next_batch(2).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_reverse() {
        let store = store_with(&["a", "b", "c", "d", "e"]);
        let mut cursor = store
            .iterator(&RangeOptions::new().with_gte("b").with_reverse(true))
            .unwrap();

        assert_eq!(keys(&cursor.next_batch(3).unwrap()), vec![b"e", b"d", b"c"]);
        assert_eq!(keys(&cursor.next_batch(3).unwrap()), vec![b"b"]);
        assert!(cursor.next_batch(3).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_seek_stays_in_range() {
        let store = store_with(&["a", "b", "c", "d", "e"]);
        let mut cursor = store
            .iterator(&RangeOptions::new().with_gte("b").with_lt("e"))
            .unwrap();

        cursor.seek(b"c");
        assert_eq!(keys(&cursor.next_batch(1).unwrap()), vec![b"c"]);

        // Seeking before the range start clamps to the range
        cursor.seek(b"0");
        assert_eq!(keys(&cursor.next_batch(10).unwrap()), vec![b"b", b"c", b"d"]);

        cursor.seek(b"z");
        assert!(cursor.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_reverse_seek_lands_at_or_below_target() {
        let store = store_with(&["a", "c", "e"]);
        let mut cursor = store
            .iterator(&RangeOptions::new().with_reverse(true))
            .unwrap();

        cursor.seek(b"d");
        assert_eq!(keys(&cursor.next_batch(5).unwrap()), vec![b"c", b"a"]);

        cursor.seek(b"e");
        assert_eq!(keys(&cursor.next_batch(1).unwrap()), vec![b"e"]);
    }

    #[test]
    fn test_cursor_reads_snapshot() {
        let store = store_with(&["a", "b"]);
        let mut cursor = store.iterator(&RangeOptions::new()).unwrap();

        store.put("c".into(), "3".into()).unwrap();
        store.delete(b"a").unwrap();

        assert_eq!(keys(&cursor.next_batch(10).unwrap()), vec![b"a", b"b"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_closed_cursor_fails() {
        let store = store_with(&["a"]);
        let mut cursor = store.iterator(&RangeOptions::new()).unwrap();
        cursor.close();
        assert!(matches!(
            cursor.next_batch(1),
            Err(StoreError::CursorClosed)
        ));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let store = store_with(&["a", "b"]);
        let mut cursor = store
            .iterator(&RangeOptions::new().with_gt("b").with_lt("a"))
            .unwrap();
        assert!(cursor.next_batch(10).unwrap().is_empty());

        let mut cursor = store
            .iterator(&RangeOptions::new().with_gt("a").with_lt("a"))
            .unwrap();
        assert!(cursor.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_clear_with_limit_and_direction() {
        let store = store_with(&["a", "b", "c", "d"]);
        store
            .clear(&RangeOptions::new().with_reverse(true).with_limit(2))
            .unwrap();
        assert_eq!(store.get(b"c").unwrap(), None);
        assert_eq!(store.get(b"d").unwrap(), None);
        assert_eq!(store.len(), 2);

        store.clear(&RangeOptions::new().with_gte("b")).unwrap();
        assert_eq!(store.len(), 1);

        store.clear(&RangeOptions::new()).unwrap();
        assert!(store.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_batches_concatenate_to_full_scan(
            keys in proptest::collection::btree_set(proptest::collection::vec(0u8..4, 0..4), 0..40),
            sizes in proptest::collection::vec(1usize..7, 1..10),
            reverse in proptest::bool::ANY,
        ) {
            let store = MemoryStore::new();
            for key in &keys {
                store.put(Bytes::copy_from_slice(key), Bytes::new()).unwrap();
            }

            let range = RangeOptions::new().with_reverse(reverse);
            let mut cursor = store.iterator(&range).unwrap();
            let mut seen = Vec::new();
            for size in sizes.iter().cycle() {
                let batch = cursor.next_batch(*size).unwrap();
                if batch.is_empty() {
                    break;
                }
                seen.extend(batch.into_iter().map(|(k, _)| k.to_vec()));
            }

            let mut expected: Vec<Vec<u8>> = keys.into_iter().collect();
            if reverse {
                expected.reverse();
            }
            proptest::prop_assert_eq!(seen, expected);
        }
    }
}
