//! volcap: deduplicating volume capture
//!
//! Walks a filesystem volume into an in-memory archive manifest. Stream
//! content is stored once per distinct digest with reference counts, and
//! security descriptors are stored once per distinct byte sequence.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod security;
pub mod store;
pub mod tree;
pub mod types;
pub mod volume;
