//! Proposal persistence.
//!
//! - [`store`]: the [`ProposalStore`] trait, staged [`Changeset`]s and queries
//! - [`memory`]: an in-memory store for tests and embedding
//! - [`json`]: a crash-safe single-file store used by the daemon
//!
//! # Crash Safety
//!
//! The JSON store writes a full snapshot per commit using
//! write-to-temp-then-rename, with fsync on both the file and its directory.

pub mod fsync;
pub mod json;
pub mod memory;
pub mod store;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use store::{Changeset, ProposalStore, Query, StoreError, StoreResult};
