//! Guest iterators.
//!
//! A remote iterator receives entries in batches pushed by the host. The host
//! stops after two unacknowledged batches; the guest acknowledges a batch once
//! the caller has consumed all of it, so at most two batches are ever buffered.
//!
//! Every yielded key becomes the iterator's bookmark. When the iterator is
//! re-registered on a new stream the host resumes just past the bookmark, or
//! at the pending seek target if no key was yielded since the last seek.

use crate::error::GuestError;
use crate::guest::Guest;
use bytes::Bytes;
use manykv_protocol::{Entry, ErrorCode, Input, IteratorOptions};
use manykv_storage::{Cursor, Store};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Entries read per storage call when iterating a forwarded store.
const LOCAL_BATCH_SIZE: usize = 64;

/// One iterator result. `key` and `value` are present only when the
/// iterator's options include them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Item {
    fn project(options: &IteratorOptions, key: Bytes, value: Option<Bytes>) -> Self {
        Self {
            key: options.keys.then_some(key),
            value: if options.values { value } else { None },
        }
    }
}

/// State shared between a remote iterator handle and the stream reader.
pub(crate) struct IteratorShared {
    options: IteratorOptions,
    state: Mutex<IterState>,
    notify: Notify,
}

#[derive(Default)]
struct IterState {
    seq: u32,
    queue: VecDeque<Batch>,
    ended: bool,
    /// A read error was surfaced; nothing more is yielded until a seek.
    errored: bool,
    consumed: u64,
    bookmark: Option<Bytes>,
    pending_seek: Option<Bytes>,
    /// Terminal failure, reported by the next `next()` call.
    failure: Option<GuestError>,
    closed: bool,
}

enum Batch {
    Entries(VecDeque<Entry>),
    Error(ErrorCode),
}

impl IteratorShared {
    pub(crate) fn new(options: IteratorOptions) -> Self {
        Self {
            options,
            state: Mutex::new(IterState::default()),
            notify: Notify::new(),
        }
    }

    /// Builds the registration message for the current stream. Anything
    /// buffered from an earlier stream is discarded since the host re-sends
    /// from the bookmark.
    pub(crate) fn descriptor(&self, id: u32) -> Input {
        let mut st = self.state.lock();
        st.queue.clear();
        st.ended = false;
        Input::Iterator {
            id,
            seq: st.seq,
            options: self.options.clone(),
            consumed: st.consumed,
            bookmark: st.bookmark.clone(),
            seek: st.pending_seek.clone(),
        }
    }

    /// Returns whether a message for `seq` is current. Messages from before
    /// the last seek, or arriving after a surfaced error, are dropped.
    fn accepts(st: &IterState, id: u32, seq: u32) -> bool {
        let current = seq == st.seq && !st.closed && !st.errored;
        if !current {
            tracing::debug!(id, seq, current = st.seq, "Dropping stale iterator message");
        }
        current
    }

    pub(crate) fn on_data(&self, id: u32, seq: u32, entries: Vec<Entry>) {
        {
            let mut st = self.state.lock();
            if !Self::accepts(&st, id, seq) || entries.is_empty() {
                return;
            }
            st.queue.push_back(Batch::Entries(entries.into()));
        }
        self.notify.notify_one();
    }

    pub(crate) fn on_end(&self, id: u32, seq: u32) {
        {
            let mut st = self.state.lock();
            if !Self::accepts(&st, id, seq) {
                return;
            }
            st.ended = true;
        }
        self.notify.notify_one();
    }

    pub(crate) fn on_error(&self, id: u32, seq: u32, code: ErrorCode) {
        {
            let mut st = self.state.lock();
            if !Self::accepts(&st, id, seq) {
                return;
            }
            tracing::debug!(id, seq, %code, "Iterator read failed on host");
            st.queue.push_back(Batch::Error(code));
        }
        self.notify.notify_one();
    }

    /// Force-closes the iterator with a failure reported exactly once.
    pub(crate) fn fail(&self, error: GuestError) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.queue.clear();
            st.failure = Some(error);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.queue.clear();
    }
}

/// What one poll of the shared state produced.
enum Step {
    Yield(Item, Option<Input>),
    Done(Result<Option<Item>, GuestError>),
    Wait,
}

struct RemoteIterator {
    guest: Guest,
    id: u32,
    shared: Arc<IteratorShared>,
    released: bool,
}

impl RemoteIterator {
    fn poll_state(&self) -> Step {
        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let st = &mut *guard;

        if let Some(error) = st.failure.take() {
            return Step::Done(Err(error));
        }
        if st.closed {
            return Step::Done(Ok(None));
        }
        if matches!(shared.options.range.limit, Some(limit) if st.consumed >= limit) {
            return Step::Done(Ok(None));
        }

        loop {
            match st.queue.front_mut() {
                Some(Batch::Error(code)) => {
                    let cause = *code;
                    st.queue.clear();
                    st.errored = true;
                    return Step::Done(Err(GuestError::IteratorRead { cause }));
                }
                Some(Batch::Entries(entries)) => {
                    let Some(entry) = entries.pop_front() else {
                        st.queue.pop_front();
                        continue;
                    };
                    let exhausted = entries.is_empty();
                    if exhausted {
                        st.queue.pop_front();
                    }

                    st.bookmark = Some(entry.key.clone());
                    st.pending_seek = None;
                    st.consumed += 1;

                    let ack = exhausted.then(|| Input::IteratorAck {
                        id: self.id,
                        seq: st.seq,
                        consumed: st.consumed,
                    });
                    let item = Item::project(&shared.options, entry.key, entry.value);
                    return Step::Yield(item, ack);
                }
                None if st.ended || st.errored => return Step::Done(Ok(None)),
                None => return Step::Wait,
            }
        }
    }

    async fn next(&mut self) -> Result<Option<Item>, GuestError> {
        loop {
            match self.poll_state() {
                Step::Yield(item, ack) => {
                    if let Some(ack) = ack {
                        self.guest.send(&ack);
                    }
                    return Ok(Some(item));
                }
                Step::Done(result) => return result,
                Step::Wait => self.shared.notify.notified().await,
            }
        }
    }

    fn seek(&mut self, target: Bytes) {
        let msg = {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.queue.clear();
            st.ended = false;
            st.errored = false;
            st.seq = st.seq.wrapping_add(1);
            st.pending_seek = Some(target.clone());
            Input::IteratorSeek {
                id: self.id,
                seq: st.seq,
                target,
            }
        };
        self.guest.send(&msg);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.close();
        self.guest.release_iterator(self.id, &self.shared);
    }
}

impl Drop for RemoteIterator {
    fn drop(&mut self) {
        self.release();
    }
}

/// Iterator over a forwarded local store. The cursor is opened on the
/// blocking pool by the first read.
struct LocalIterator {
    store: Arc<dyn Store>,
    cursor: Option<Box<dyn Cursor>>,
    opened: bool,
    /// Seek target recorded before the cursor was opened.
    pending_seek: Option<Bytes>,
    options: IteratorOptions,
    buffer: VecDeque<(Bytes, Bytes)>,
    consumed: u64,
    ended: bool,
}

impl LocalIterator {
    async fn next(&mut self) -> Result<Option<Item>, GuestError> {
        if matches!(self.options.range.limit, Some(limit) if self.consumed >= limit) {
            return Ok(None);
        }

        if self.buffer.is_empty() && !self.ended {
            let cursor = match self.cursor.take() {
                Some(cursor) => Some(cursor),
                None if self.opened => return Ok(None),
                None => None,
            };
            let store = self.store.clone();
            let range = self.options.range.clone();
            let seek = self.pending_seek.take();
            let (cursor, result) = tokio::task::spawn_blocking(move || {
                let mut cursor = match cursor {
                    Some(cursor) => cursor,
                    None => match store.iterator(&range) {
                        Ok(cursor) => cursor,
                        Err(e) => return (None, Err(GuestError::from(e))),
                    },
                };
                if let Some(target) = seek {
                    cursor.seek(&target);
                }
                let result = cursor
                    .next_batch(LOCAL_BATCH_SIZE)
                    .map_err(|e| GuestError::IteratorRead {
                        cause: e.wire_code(),
                    });
                (Some(cursor), result)
            })
            .await
            .map_err(std::io::Error::from)?;
            self.opened = true;
            self.cursor = cursor;

            let batch = result?;
            self.ended = batch.is_empty();
            self.buffer.extend(batch);
        }

        Ok(self.buffer.pop_front().map(|(key, value)| {
            self.consumed += 1;
            Item::project(&self.options, key, Some(value))
        }))
    }

    fn seek(&mut self, target: Bytes) {
        self.buffer.clear();
        self.ended = false;
        match self.cursor.as_mut() {
            Some(cursor) => cursor.seek(&target),
            None if !self.opened => self.pending_seek = Some(target),
            None => {}
        }
    }
}

impl Drop for LocalIterator {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}

enum Kind {
    Remote(RemoteIterator),
    Local(LocalIterator),
}

/// An ordered iterator over a key range.
///
/// `next` takes `&mut self`, so an iterator never has two reads in flight.
pub struct GuestIterator {
    kind: Kind,
}

impl GuestIterator {
    pub(crate) fn remote(guest: Guest, id: u32, shared: Arc<IteratorShared>) -> Self {
        Self {
            kind: Kind::Remote(RemoteIterator {
                guest,
                id,
                shared,
                released: false,
            }),
        }
    }

    pub(crate) fn local(store: Arc<dyn Store>, options: IteratorOptions) -> Self {
        Self {
            kind: Kind::Local(LocalIterator {
                store,
                cursor: None,
                opened: false,
                pending_seek: None,
                options,
                buffer: VecDeque::new(),
                consumed: 0,
                ended: false,
            }),
        }
    }

    /// Returns the wire id of a remote iterator.
    pub fn id(&self) -> Option<u32> {
        match &self.kind {
            Kind::Remote(it) => Some(it.id),
            Kind::Local(_) => None,
        }
    }

    /// Returns the next entry, or `None` once the range is exhausted or the
    /// limit is reached.
    ///
    /// A host read failure is returned once as [`GuestError::IteratorRead`];
    /// the iterator then yields `None` until it is repositioned with
    /// [`GuestIterator::seek`].
    pub async fn next(&mut self) -> Result<Option<Item>, GuestError> {
        match &mut self.kind {
            Kind::Remote(it) => it.next().await,
            Kind::Local(it) => it.next().await,
        }
    }

    /// Repositions the iterator: forward iterators continue at the first key
    /// `>= target`, reverse iterators at the last key `<= target`. Entries
    /// buffered before the seek are discarded.
    pub fn seek(&mut self, target: impl Into<Bytes>) {
        let target = target.into();
        match &mut self.kind {
            Kind::Remote(it) => it.seek(target),
            Kind::Local(it) => it.seek(target),
        }
    }

    /// Closes the iterator, releasing it on the host.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manykv_protocol::Output;
    use std::time::Duration;
    use tokio::time::timeout;

    fn batch(keys: &[&'static str]) -> Vec<Entry> {
        keys.iter().map(|&k| Entry::new(k, None)).collect()
    }

    #[tokio::test]
    async fn test_messages_from_before_seek_are_dropped() {
        let guest = Guest::default();
        let mut it = guest.iterator(IteratorOptions::new()).unwrap();
        let id = it.id().unwrap();

        it.seek("x");
        guest.dispatch(Output::IteratorData {
            id,
            seq: 0,
            entries: batch(&["stale"]),
        });
        guest.dispatch(Output::IteratorEnd { id, seq: 0 });
        guest.dispatch(Output::IteratorError {
            id,
            seq: 0,
            error: ErrorCode::Corruption,
        });
        assert!(timeout(Duration::from_millis(100), it.next()).await.is_err());

        guest.dispatch(Output::IteratorData {
            id,
            seq: 1,
            entries: batch(&["x"]),
        });
        let item = it.next().await.unwrap().unwrap();
        assert_eq!(item.key, Some(Bytes::from("x")));

        guest.dispatch(Output::IteratorEnd { id, seq: 1 });
        assert_eq!(it.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_surfaces_once_until_seek() {
        let guest = Guest::default();
        let mut it = guest.iterator(IteratorOptions::new()).unwrap();
        let id = it.id().unwrap();

        guest.dispatch(Output::IteratorError {
            id,
            seq: 0,
            error: ErrorCode::Corruption,
        });
        let err = it.next().await.unwrap_err();
        assert!(matches!(
            err,
            GuestError::IteratorRead {
                cause: ErrorCode::Corruption
            }
        ));
        guest.dispatch(Output::IteratorData {
            id,
            seq: 0,
            entries: batch(&["late"]),
        });
        assert_eq!(it.next().await.unwrap(), None);

        it.seek("a");
        guest.dispatch(Output::IteratorData {
            id,
            seq: 1,
            entries: batch(&["a"]),
        });
        let item = it.next().await.unwrap().unwrap();
        assert_eq!(item.key, Some(Bytes::from("a")));
    }

    #[tokio::test]
    async fn test_reregistration_discards_queued_error() {
        let guest = Guest::default();
        let mut it = guest.iterator(IteratorOptions::new()).unwrap();
        let id = it.id().unwrap();
        let shared = guest.inner.state.lock().iterators.get(id).cloned().unwrap();

        guest.dispatch(Output::IteratorError {
            id,
            seq: 0,
            error: ErrorCode::Corruption,
        });
        assert!(matches!(shared.descriptor(id), Input::Iterator { seq: 0, .. }));
        assert!(timeout(Duration::from_millis(100), it.next()).await.is_err());

        guest.dispatch(Output::IteratorData {
            id,
            seq: 0,
            entries: batch(&["a"]),
        });
        let item = it.next().await.unwrap().unwrap();
        assert_eq!(item.key, Some(Bytes::from("a")));
    }
}
