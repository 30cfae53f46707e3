//! Message catalog: typed messages for each direction and their payload layouts.
//!
//! Payload primitives:
//!
//! - integers are varints
//! - byte strings are `varint(len) ++ bytes`
//! - optionals are a presence byte (`0` absent, `1` present) followed by the value
//! - lists are `varint(count) ++ items`
//! - error codes are UTF-8 byte strings
//!
//! Decoders ignore bytes after the last known field, so newer peers can
//! append fields without breaking older ones.

use crate::error::{ErrorCode, ProtocolError};
use crate::varint::{decode_varint, put_varint};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Bound;

/// Tag numbers. Both ends must agree on these for interoperability.
pub mod tag {
    /// Guest to host.
    pub mod input {
        pub const GET: u8 = 0;
        pub const PUT: u8 = 1;
        pub const DELETE: u8 = 2;
        pub const BATCH: u8 = 3;
        pub const ITERATOR: u8 = 4;
        pub const CLEAR: u8 = 5;
        pub const GET_MANY: u8 = 6;
        pub const ITERATOR_CLOSE: u8 = 7;
        pub const ITERATOR_ACK: u8 = 8;
        pub const ITERATOR_SEEK: u8 = 9;
    }

    /// Host to guest.
    pub mod output {
        pub const CALLBACK: u8 = 0;
        pub const ITERATOR_DATA: u8 = 1;
        pub const GET_MANY_CALLBACK: u8 = 2;
        pub const ITERATOR_ERROR: u8 = 3;
        pub const ITERATOR_END: u8 = 4;
    }
}

// =============================================================================
// Shared types
// =============================================================================

/// Key range selection, shared by iterators and `clear`.
///
/// When both an exclusive and an inclusive bound are given for the same side,
/// the exclusive one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub gt: Option<Bytes>,
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub lte: Option<Bytes>,
    /// Walk the range from the largest key down.
    pub reverse: bool,
    /// Maximum number of entries; `None` means unlimited.
    pub limit: Option<u64>,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gt(mut self, key: impl Into<Bytes>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn with_gte(mut self, key: impl Into<Bytes>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn with_lt(mut self, key: impl Into<Bytes>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn with_lte(mut self, key: impl Into<Bytes>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns the lower bound of the range.
    pub fn lower_bound(&self) -> Bound<&[u8]> {
        match (&self.gt, &self.gte) {
            (Some(gt), _) => Bound::Excluded(gt),
            (None, Some(gte)) => Bound::Included(gte),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Returns the upper bound of the range.
    pub fn upper_bound(&self) -> Bound<&[u8]> {
        match (&self.lt, &self.lte) {
            (Some(lt), _) => Bound::Excluded(lt),
            (None, Some(lte)) => Bound::Included(lte),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Returns whether `key` falls inside the range bounds.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match self.lower_bound() {
            Bound::Excluded(b) => key > b,
            Bound::Included(b) => key >= b,
            Bound::Unbounded => true,
        };
        let below = match self.upper_bound() {
            Bound::Excluded(b) => key < b,
            Bound::Included(b) => key <= b,
            Bound::Unbounded => true,
        };
        above && below
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_opt_bytes(buf, self.gt.as_deref());
        put_opt_bytes(buf, self.gte.as_deref());
        put_opt_bytes(buf, self.lt.as_deref());
        put_opt_bytes(buf, self.lte.as_deref());
        put_bool(buf, self.reverse);
        match self.limit {
            Some(limit) => {
                buf.put_u8(1);
                put_varint(buf, limit);
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            gt: r.opt_bytes()?,
            gte: r.opt_bytes()?,
            lt: r.opt_bytes()?,
            lte: r.opt_bytes()?,
            reverse: r.bool()?,
            limit: if r.bool()? { Some(r.varint()?) } else { None },
        })
    }
}

/// Iterator options: a range plus which parts of each entry to yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    pub range: RangeOptions,
    /// Yield keys.
    pub keys: bool,
    /// Yield values. When false the host does not transmit values at all.
    pub values: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            range: RangeOptions::default(),
            keys: true,
            values: true,
        }
    }
}

impl From<RangeOptions> for IteratorOptions {
    fn from(range: RangeOptions) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }
}

impl IteratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields keys only.
    pub fn keys_only(mut self) -> Self {
        self.keys = true;
        self.values = false;
        self
    }

    /// Yields values only.
    pub fn values_only(mut self) -> Self {
        self.keys = false;
        self.values = true;
        self
    }

    pub fn with_gt(mut self, key: impl Into<Bytes>) -> Self {
        self.range = self.range.with_gt(key);
        self
    }

    pub fn with_gte(mut self, key: impl Into<Bytes>) -> Self {
        self.range = self.range.with_gte(key);
        self
    }

    pub fn with_lt(mut self, key: impl Into<Bytes>) -> Self {
        self.range = self.range.with_lt(key);
        self
    }

    pub fn with_lte(mut self, key: impl Into<Bytes>) -> Self {
        self.range = self.range.with_lte(key);
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.range = self.range.with_reverse(reverse);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.range = self.range.with_limit(limit);
        self
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.range.encode(buf);
        put_bool(buf, self.keys);
        put_bool(buf, self.values);
    }

    fn decode(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            range: RangeOptions::decode(r)?,
            keys: r.bool()?,
            values: r.bool()?,
        })
    }
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Bytes, value: Bytes },
    Del { key: Bytes },
}

impl BatchOp {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Bytes>) -> Self {
        BatchOp::Del { key: key.into() }
    }

    /// Returns the key the operation touches.
    pub fn key(&self) -> &Bytes {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Del { key } => key,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            BatchOp::Put { key, value } => {
                buf.put_u8(0);
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
            BatchOp::Del { key } => {
                buf.put_u8(1);
                put_bytes(buf, key);
            }
        }
    }

    fn decode(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.u8()? {
            0 => Ok(BatchOp::Put {
                key: r.bytes()?,
                value: r.bytes()?,
            }),
            1 => Ok(BatchOp::Del { key: r.bytes()? }),
            other => Err(ProtocolError::InvalidValue {
                field: "batch op",
                value: u64::from(other),
            }),
        }
    }
}

/// An iterator entry as transmitted: the key always (resumption needs it),
/// the value only when the iterator asked for values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Entry {
    pub fn new(key: impl Into<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

// =============================================================================
// Guest -> host
// =============================================================================

/// Messages sent by a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Get {
        id: u32,
        key: Bytes,
    },
    Put {
        id: u32,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        id: u32,
        key: Bytes,
    },
    Batch {
        id: u32,
        ops: Vec<BatchOp>,
    },
    /// Opens an iterator, or re-registers one after a reconnect.
    Iterator {
        id: u32,
        seq: u32,
        options: IteratorOptions,
        /// Entries the guest has already yielded.
        consumed: u64,
        /// Last key yielded; the host resumes just past it.
        bookmark: Option<Bytes>,
        /// Seek target not yet followed by any yielded key; takes precedence
        /// over `bookmark`.
        seek: Option<Bytes>,
    },
    Clear {
        id: u32,
        options: RangeOptions,
    },
    GetMany {
        id: u32,
        keys: Vec<Bytes>,
    },
    IteratorClose {
        id: u32,
    },
    IteratorAck {
        id: u32,
        seq: u32,
        consumed: u64,
    },
    IteratorSeek {
        id: u32,
        seq: u32,
        target: Bytes,
    },
}

impl Input {
    /// Returns the message tag.
    pub fn tag(&self) -> u8 {
        use tag::input::*;
        match self {
            Input::Get { .. } => GET,
            Input::Put { .. } => PUT,
            Input::Delete { .. } => DELETE,
            Input::Batch { .. } => BATCH,
            Input::Iterator { .. } => ITERATOR,
            Input::Clear { .. } => CLEAR,
            Input::GetMany { .. } => GET_MANY,
            Input::IteratorClose { .. } => ITERATOR_CLOSE,
            Input::IteratorAck { .. } => ITERATOR_ACK,
            Input::IteratorSeek { .. } => ITERATOR_SEEK,
        }
    }

    /// Returns the request or iterator id the message refers to.
    pub fn id(&self) -> u32 {
        match self {
            Input::Get { id, .. }
            | Input::Put { id, .. }
            | Input::Delete { id, .. }
            | Input::Batch { id, .. }
            | Input::Iterator { id, .. }
            | Input::Clear { id, .. }
            | Input::GetMany { id, .. }
            | Input::IteratorClose { id }
            | Input::IteratorAck { id, .. }
            | Input::IteratorSeek { id, .. } => *id,
        }
    }

    /// Appends the payload (without tag) to `buf`.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Input::Get { id, key } | Input::Delete { id, key } => {
                put_varint(buf, u64::from(*id));
                put_bytes(buf, key);
            }
            Input::Put { id, key, value } => {
                put_varint(buf, u64::from(*id));
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
            Input::Batch { id, ops } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, ops.len() as u64);
                for op in ops {
                    op.encode(buf);
                }
            }
            Input::Iterator {
                id,
                seq,
                options,
                consumed,
                bookmark,
                seek,
            } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
                options.encode(buf);
                put_varint(buf, *consumed);
                put_opt_bytes(buf, bookmark.as_deref());
                put_opt_bytes(buf, seek.as_deref());
            }
            Input::Clear { id, options } => {
                put_varint(buf, u64::from(*id));
                options.encode(buf);
            }
            Input::GetMany { id, keys } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, keys.len() as u64);
                for key in keys {
                    put_bytes(buf, key);
                }
            }
            Input::IteratorClose { id } => {
                put_varint(buf, u64::from(*id));
            }
            Input::IteratorAck { id, seq, consumed } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
                put_varint(buf, *consumed);
            }
            Input::IteratorSeek { id, seq, target } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
                put_bytes(buf, target);
            }
        }
    }

    /// Decodes a message from its tag and payload.
    pub fn decode(tag: u8, payload: Bytes) -> Result<Self, ProtocolError> {
        use tag::input::*;
        let mut r = Reader::new(payload);
        let msg = match tag {
            GET => Input::Get {
                id: r.u32()?,
                key: r.bytes()?,
            },
            PUT => Input::Put {
                id: r.u32()?,
                key: r.bytes()?,
                value: r.bytes()?,
            },
            DELETE => Input::Delete {
                id: r.u32()?,
                key: r.bytes()?,
            },
            BATCH => {
                let id = r.u32()?;
                let count = r.count()?;
                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    ops.push(BatchOp::decode(&mut r)?);
                }
                Input::Batch { id, ops }
            }
            ITERATOR => Input::Iterator {
                id: r.u32()?,
                seq: r.u32()?,
                options: IteratorOptions::decode(&mut r)?,
                consumed: r.varint()?,
                bookmark: r.opt_bytes()?,
                seek: r.opt_bytes()?,
            },
            CLEAR => Input::Clear {
                id: r.u32()?,
                options: RangeOptions::decode(&mut r)?,
            },
            GET_MANY => {
                let id = r.u32()?;
                let count = r.count()?;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(r.bytes()?);
                }
                Input::GetMany { id, keys }
            }
            ITERATOR_CLOSE => Input::IteratorClose { id: r.u32()? },
            ITERATOR_ACK => Input::IteratorAck {
                id: r.u32()?,
                seq: r.u32()?,
                consumed: r.varint()?,
            },
            ITERATOR_SEEK => Input::IteratorSeek {
                id: r.u32()?,
                seq: r.u32()?,
                target: r.bytes()?,
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

// =============================================================================
// Host -> guest
// =============================================================================

/// Messages sent by a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Completion of a get/put/delete/batch/clear request.
    Callback {
        id: u32,
        error: Option<ErrorCode>,
        value: Option<Bytes>,
    },
    IteratorData {
        id: u32,
        seq: u32,
        entries: Vec<Entry>,
    },
    GetManyCallback {
        id: u32,
        error: Option<ErrorCode>,
        values: Vec<Option<Bytes>>,
    },
    IteratorError {
        id: u32,
        seq: u32,
        error: ErrorCode,
    },
    IteratorEnd {
        id: u32,
        seq: u32,
    },
}

impl Output {
    /// Returns the message tag.
    pub fn tag(&self) -> u8 {
        use tag::output::*;
        match self {
            Output::Callback { .. } => CALLBACK,
            Output::IteratorData { .. } => ITERATOR_DATA,
            Output::GetManyCallback { .. } => GET_MANY_CALLBACK,
            Output::IteratorError { .. } => ITERATOR_ERROR,
            Output::IteratorEnd { .. } => ITERATOR_END,
        }
    }

    /// Returns the request or iterator id the message refers to.
    pub fn id(&self) -> u32 {
        match self {
            Output::Callback { id, .. }
            | Output::IteratorData { id, .. }
            | Output::GetManyCallback { id, .. }
            | Output::IteratorError { id, .. }
            | Output::IteratorEnd { id, .. } => *id,
        }
    }

    /// Appends the payload (without tag) to `buf`.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Output::Callback { id, error, value } => {
                put_varint(buf, u64::from(*id));
                put_opt_bytes(buf, error.map(|e| e.as_str().as_bytes()));
                put_opt_bytes(buf, value.as_deref());
            }
            Output::IteratorData { id, seq, entries } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
                put_varint(buf, entries.len() as u64);
                for entry in entries {
                    put_bytes(buf, &entry.key);
                    put_opt_bytes(buf, entry.value.as_deref());
                }
            }
            Output::GetManyCallback { id, error, values } => {
                put_varint(buf, u64::from(*id));
                put_opt_bytes(buf, error.map(|e| e.as_str().as_bytes()));
                put_varint(buf, values.len() as u64);
                for value in values {
                    put_opt_bytes(buf, value.as_deref());
                }
            }
            Output::IteratorError { id, seq, error } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
                put_bytes(buf, error.as_str().as_bytes());
            }
            Output::IteratorEnd { id, seq } => {
                put_varint(buf, u64::from(*id));
                put_varint(buf, u64::from(*seq));
            }
        }
    }

    /// Decodes a message from its tag and payload.
    pub fn decode(tag: u8, payload: Bytes) -> Result<Self, ProtocolError> {
        use tag::output::*;
        let mut r = Reader::new(payload);
        let msg = match tag {
            CALLBACK => Output::Callback {
                id: r.u32()?,
                error: r.opt_code()?,
                value: r.opt_bytes()?,
            },
            ITERATOR_DATA => {
                let id = r.u32()?;
                let seq = r.u32()?;
                let count = r.count()?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(Entry {
                        key: r.bytes()?,
                        value: r.opt_bytes()?,
                    });
                }
                Output::IteratorData { id, seq, entries }
            }
            GET_MANY_CALLBACK => {
                let id = r.u32()?;
                let error = r.opt_code()?;
                let count = r.count()?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(r.opt_bytes()?);
                }
                Output::GetManyCallback { id, error, values }
            }
            ITERATOR_ERROR => Output::IteratorError {
                id: r.u32()?,
                seq: r.u32()?,
                error: r.code()?,
            },
            ITERATOR_END => Output::IteratorEnd {
                id: r.u32()?,
                seq: r.u32()?,
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

// =============================================================================
// Payload primitives
// =============================================================================

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_opt_bytes(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data);
        }
        None => buf.put_u8(0),
    }
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Cursor over a payload. Byte strings are sliced out without copying.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        if self.buf.is_empty() {
            return Err(ProtocolError::Truncated { needed: 1 });
        }
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                field: "flag",
                value: u64::from(other),
            }),
        }
    }

    fn varint(&mut self) -> Result<u64, ProtocolError> {
        match decode_varint(&self.buf)? {
            Some((value, len)) => {
                self.buf.advance(len);
                Ok(value)
            }
            None => Err(ProtocolError::Truncated { needed: 1 }),
        }
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let value = self.varint()?;
        u32::try_from(value).map_err(|_| ProtocolError::VarintOverflow { bits: 32 })
    }

    /// Reads a list length, refusing counts the remaining payload cannot hold.
    fn count(&mut self) -> Result<usize, ProtocolError> {
        let count = self.varint()?;
        if count > self.buf.len() as u64 {
            return Err(ProtocolError::Truncated {
                needed: (count - self.buf.len() as u64) as usize,
            });
        }
        Ok(count as usize)
    }

    fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.varint()?;
        if len > self.buf.len() as u64 {
            return Err(ProtocolError::Truncated {
                needed: (len - self.buf.len() as u64) as usize,
            });
        }
        Ok(self.buf.split_to(len as usize))
    }

    fn opt_bytes(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.bool()? {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    fn code(&mut self) -> Result<ErrorCode, ProtocolError> {
        let raw = self.bytes()?;
        let code = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(ErrorCode::from_wire(code))
    }

    fn opt_code(&mut self) -> Result<Option<ErrorCode>, ProtocolError> {
        if self.bool()? {
            Ok(Some(self.code()?))
        } else {
            Ok(None)
        }
    }
}
