//! # manykv-protocol
//!
//! Wire protocol shared by manykv guests and hosts.
//!
//! This crate provides:
//! - Varint length-prefixed, tagged binary framing
//! - The message catalog for both directions of a stream
//! - Range and iterator option types
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod varint;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, MAX_PREFIX_LEN};
pub use message::{BatchOp, Entry, Input, IteratorOptions, Output, RangeOptions};

/// Maximum frame length, tag included (64 MiB).
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;
