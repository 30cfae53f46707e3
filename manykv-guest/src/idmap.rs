//! Correlation table keyed by wire ids.
//!
//! Ids are `u32`, issued sequentially from 1, wrapping from `u32::MAX` back to
//! 1 and skipping ids that are still live. Entries iterate in ascending id
//! order, which is the order requests were issued in until the counter wraps.

use std::collections::BTreeMap;
use std::convert::Infallible;

/// Maps live ids to pending items.
#[derive(Debug)]
pub struct IdMap<T> {
    seq: u32,
    items: BTreeMap<u32, T>,
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        Self {
            seq: 0,
            items: BTreeMap::new(),
        }
    }

    /// Inserts `item` under a fresh id and returns the id.
    pub fn add(&mut self, item: T) -> u32 {
        self.add_with(|_| item)
    }

    /// Inserts the item built from a fresh id and returns the id.
    pub fn add_with(&mut self, make: impl FnOnce(u32) -> T) -> u32 {
        match self.try_add_with(|id| Ok::<_, Infallible>(make(id))) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    /// Like [`IdMap::add_with`], but nothing is inserted if `make` fails.
    pub fn try_add_with<E>(
        &mut self,
        make: impl FnOnce(u32) -> Result<T, E>,
    ) -> Result<u32, E> {
        let id = self.next_id();
        let item = make(id)?;
        self.items.insert(id, item);
        Ok(id)
    }

    fn next_id(&mut self) -> u32 {
        // Terminates as long as fewer than u32::MAX ids are live
        loop {
            self.seq = if self.seq == u32::MAX { 1 } else { self.seq + 1 };
            if !self.items.contains_key(&self.seq) {
                return self.seq;
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.items.remove(&id)
    }

    /// Removes and returns every entry in id order, and restarts id issuing at 1.
    pub fn drain_all(&mut self) -> Vec<(u32, T)> {
        self.seq = 0;
        std::mem::take(&mut self.items).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.items.iter().map(|(id, item)| (*id, item))
    }
}

impl<T> Default for IdMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
