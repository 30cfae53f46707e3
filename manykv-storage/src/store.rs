//! Storage engine contract.
//!
//! A host only ever talks to its database through these two traits. Calls are
//! synchronous; the host runs them on the blocking pool.

use crate::error::StoreError;
use bytes::Bytes;
use manykv_protocol::{BatchOp, RangeOptions};

/// An ordered key-value store over raw bytes.
pub trait Store: Send + Sync + 'static {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Returns the values of `keys`, in order.
    fn get_many(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>, StoreError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Applies all operations atomically.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Deletes the entries selected by `range`, honoring its direction and limit.
    fn clear(&self, range: &RangeOptions) -> Result<(), StoreError>;

    /// Opens a cursor over `range`. The cursor walks in the range's direction;
    /// its `limit` is left to the caller.
    fn iterator(&self, range: &RangeOptions) -> Result<Box<dyn Cursor>, StoreError>;
}

/// A positioned walk over a store range.
pub trait Cursor: Send {
    /// Returns up to `n` entries. An empty batch means the cursor is exhausted
    /// at its current position.
    fn next_batch(&mut self, n: usize) -> Result<Vec<(Bytes, Bytes)>, StoreError>;

    /// Repositions the cursor. Forward cursors continue at the first key
    /// `>= target`, reverse cursors at the last key `<= target`. Keys outside
    /// the original range are never yielded.
    fn seek(&mut self, target: &[u8]);

    /// Releases the cursor. Further reads fail.
    fn close(&mut self);
}
