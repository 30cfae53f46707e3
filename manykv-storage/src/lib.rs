//! # manykv-storage
//!
//! Storage layer for manykv hosts.
//!
//! This crate provides:
//! - The `Store` / `Cursor` contract a host serves guests from
//! - Storage error type with protocol error codes
//! - `MemoryStore`, an in-memory ordered engine

pub mod error;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{Cursor, Store};
