//! Embedded storage engine for the Symbiont storage layer.
//!
//! The owner context opens exactly one engine per process and serves every
//! other context from it. This crate provides the engine contract and its
//! `sled` implementation; it knows nothing about roles or channels.
//!
//! # Modules
//!
//! - [`engine`] -- The [`StorageEngine`] trait (async CRUD surface)
//! - [`sled_engine`] -- [`SledEngine`], the durable `sled`-backed engine
//! - [`error`] -- Shared error types

pub mod engine;
pub mod error;
pub mod sled_engine;

// Re-export primary types for convenience.
pub use engine::StorageEngine;
pub use error::StoreError;
pub use sled_engine::{SledEngine, StoreConfig};
