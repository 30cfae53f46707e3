//! # manykv-guest
//!
//! Guest library for manykv.
//!
//! This crate provides:
//! - Async get/put/delete/batch/clear over any byte stream
//! - Flow-controlled iterators with seek
//! - Transparent resumption of requests and iterators across reconnects
//! - A forwarding mode that serves everything from a local store

pub mod config;
pub mod connection;
pub mod error;
pub mod guest;
pub mod idmap;
pub mod iterator;


pub use config::GuestConfig;
pub use connection::Connection;
pub use error::GuestError;
pub use guest::Guest;
pub use idmap::IdMap;
pub use iterator::{GuestIterator, Item};
