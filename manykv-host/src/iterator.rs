//! Host side of the iterator protocol.
//!
//! A host iterator owns a storage cursor and pushes batches to the guest:
//!
//! - the first read after opening or seeking fetches a single entry, so a
//!   guest that only wants the first match costs one lookup
//! - every later read fills the stream's free write buffer, sized by the
//!   largest entry seen so far, but never fewer than 16 entries
//! - no read starts while two batches are unacknowledged
//! - the limit is enforced here, against what the guest reports consumed
//!   plus what has been sent since
//!
//! The cursor is moved into the blocking pool for the duration of a read, so
//! reads on one iterator never overlap. Seeks arriving meanwhile are deferred
//! until the read returns, and only the latest one is kept.

use bytes::Bytes;
use manykv_protocol::{Encoder, Entry, ErrorCode, IteratorOptions, Output};
use manykv_storage::Cursor;

/// Entries read ahead when the write buffer is nearly full.
const MIN_READ_AHEAD: usize = 16;

/// Where a repositioned cursor continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekTarget {
    Key(Bytes),
    /// Nothing can follow; the next read ends the iterator.
    Exhausted,
}

/// Returns the seek target that continues a walk just past `bookmark`.
///
/// Forward walks seek to the smallest key greater than the bookmark. Reverse
/// walks decrement the last byte, or drop it if it is zero. The result is at
/// or below every key smaller than the bookmark, except keys that extend the
/// decremented prefix (resuming before `ab` skips `aa\x01`).
pub fn resume_target(bookmark: &[u8], reverse: bool) -> SeekTarget {
    if !reverse {
        let mut target = Vec::with_capacity(bookmark.len() + 1);
        target.extend_from_slice(bookmark);
        target.push(0);
        return SeekTarget::Key(target.into());
    }

    match bookmark.split_last() {
        None => SeekTarget::Exhausted,
        Some((&0, prefix)) => SeekTarget::Key(Bytes::copy_from_slice(prefix)),
        Some((&last, prefix)) => {
            let mut target = prefix.to_vec();
            target.push(last - 1);
            SeekTarget::Key(target.into())
        }
    }
}

/// A storage read to run on the blocking pool.
pub(crate) enum Read {
    Cursor { cursor: Box<dyn Cursor>, size: usize },
    /// Completes immediately with no entries.
    Empty,
}

/// What finishing a read produced.
pub(crate) enum Completion {
    /// A deferred seek was applied instead; the old result is discarded.
    Reseek(Option<Read>),
    /// A frame for the guest, after which the iterator may read ahead.
    Send { frame: Bytes, read_ahead: bool },
}

pub(crate) struct HostIterator {
    pub(crate) id: u32,
    /// Distinguishes this iterator from a later one reusing the id.
    pub(crate) token: u64,
    pub(crate) seq: u32,
    values: bool,
    /// Absent while a read holds it.
    cursor: Option<Box<dyn Cursor>>,
    busy: bool,
    read_ahead: bool,
    max_item_len: usize,
    pending_acks: u32,
    consumed: u64,
    /// Entries sent under the current sequence, counted from `consumed`.
    sent: u64,
    limit: Option<u64>,
    ended: bool,
    errored: bool,
    pending_seek: Option<(u32, SeekTarget)>,
}

impl HostIterator {
    pub(crate) fn new(
        id: u32,
        token: u64,
        seq: u32,
        options: &IteratorOptions,
        consumed: u64,
        cursor: Option<Box<dyn Cursor>>,
    ) -> Self {
        Self {
            id,
            token,
            seq,
            values: options.values,
            errored: cursor.is_none(),
            cursor,
            busy: false,
            read_ahead: false,
            max_item_len: 1,
            pending_acks: 0,
            consumed,
            sent: consumed,
            limit: options.range.limit,
            ended: false,
            pending_seek: None,
        }
    }

    /// Starts the next read if flow control allows one. `room` is the free
    /// space in the stream's write buffer.
    pub(crate) fn next(&mut self, first: bool, room: usize) -> Option<Read> {
        if self.busy || self.ended || self.errored || self.pending_acks > 1 {
            return None;
        }

        let mut size = self
            .limit
            .map_or(u64::MAX, |limit| limit.saturating_sub(self.consumed.max(self.sent)));

        if first {
            size = size.min(1);
            self.read_ahead = false;
        } else {
            let room = room.max(1);
            let fits = (room + self.max_item_len / 2) / self.max_item_len;
            size = size.min(fits.max(MIN_READ_AHEAD) as u64);
            self.read_ahead = true;
        }

        self.busy = true;
        if size == 0 {
            return Some(Read::Empty);
        }
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        Some(match self.cursor.take() {
            Some(cursor) => Read::Cursor { cursor, size },
            None => Read::Empty,
        })
    }

    /// Repositions the iterator under a new sequence number, or defers the
    /// seek while a read is in flight.
    pub(crate) fn seek(&mut self, seq: u32, target: SeekTarget) -> Option<Read> {
        if self.busy {
            self.pending_seek = Some((seq, target));
            return None;
        }

        self.pending_seek = None;
        self.ended = false;
        self.errored = false;
        self.seq = seq;
        self.pending_acks = 0;
        self.sent = self.consumed;

        match target {
            SeekTarget::Exhausted => {
                self.busy = true;
                Some(Read::Empty)
            }
            SeekTarget::Key(key) => {
                if let Some(cursor) = self.cursor.as_mut() {
                    cursor.seek(&key);
                }
                self.next(true, 0)
            }
        }
    }

    /// Records a guest acknowledgement. Returns false if it belongs to an
    /// earlier sequence and was ignored.
    pub(crate) fn ack(&mut self, seq: u32, consumed: u64) -> bool {
        if seq != self.seq {
            return false;
        }
        self.pending_acks = self.pending_acks.saturating_sub(1);
        self.consumed = self.consumed.max(consumed);
        true
    }

    /// Finishes a read. `cursor` is the cursor the read took, if any.
    pub(crate) fn complete(
        &mut self,
        cursor: Option<Box<dyn Cursor>>,
        result: Result<Vec<(Bytes, Bytes)>, ErrorCode>,
    ) -> Completion {
        self.busy = false;
        if cursor.is_some() {
            self.cursor = cursor;
        }

        if let Some((seq, target)) = self.pending_seek.take() {
            return Completion::Reseek(self.seek(seq, target));
        }

        let items = match result {
            Ok(items) => items,
            Err(code) => return self.fail(code),
        };

        if items.is_empty() {
            self.ended = true;
            let end = Output::IteratorEnd {
                id: self.id,
                seq: self.seq,
            };
            return match Encoder::encode_output(&end) {
                Ok(frame) => Completion::Send {
                    frame,
                    read_ahead: false,
                },
                Err(e) => {
                    tracing::error!(id = self.id, error = %e, "Failed to encode iterator end");
                    Completion::Reseek(None)
                }
            };
        }

        let count = items.len();
        let data = Output::IteratorData {
            id: self.id,
            seq: self.seq,
            entries: items
                .into_iter()
                .map(|(key, value)| Entry {
                    key,
                    value: self.values.then_some(value),
                })
                .collect(),
        };

        let frame = match Encoder::encode_output(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = self.id, error = %e, "Iterator batch too large to send");
                return self.fail(ErrorCode::RemoteError);
            }
        };

        self.max_item_len = self.max_item_len.max(frame.len().div_ceil(count));
        self.pending_acks += 1;
        self.sent = self.consumed.max(self.sent) + count as u64;
        Completion::Send {
            frame,
            read_ahead: self.read_ahead,
        }
    }

    fn fail(&mut self, code: ErrorCode) -> Completion {
        self.errored = true;
        let error = Output::IteratorError {
            id: self.id,
            seq: self.seq,
            error: code,
        };
        match Encoder::encode_output(&error) {
            Ok(frame) => Completion::Send {
                frame,
                read_ahead: false,
            },
            Err(e) => {
                tracing::error!(id = self.id, error = %e, "Failed to encode iterator error");
                Completion::Reseek(None)
            }
        }
    }

    /// Closes the cursor, if no read holds it.
    pub(crate) fn close(mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}
