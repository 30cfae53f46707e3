//! # manykv-host
//!
//! Host side of manykv.
//!
//! This crate provides:
//! - Serving one store to any number of guest byte streams
//! - Flow-controlled iterator reads with read-ahead
//! - Read-only mode and pre-write hooks
//! - A TCP server and YAML/environment configuration

pub mod config;
pub mod error;
pub mod host;
pub mod iterator;
pub mod server;
mod session;

pub use config::{Config, ConfigError, HostConfig, NetworkConfig, DEFAULT_PORT};
pub use error::HostError;
pub use host::{BatchHook, DelHook, Host, HostOptions, PutHook, DEFAULT_WRITE_HIGH_WATER_MARK};
pub use iterator::{resume_target, SeekTarget};
pub use server::{Server, ServerConfig, ServerStats};
