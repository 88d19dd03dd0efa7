//! Core domain types for the integration engine.
//!
//! This module contains the fundamental types used throughout the crate,
//! designed to encode invariants via the type system.

pub mod history;
pub mod ids;
pub mod proposal;

pub use history::{HistoryEntry, HistoryEvent};
pub use ids::{InvalidSha, ProposalId, RepoId, Sha, UserId};
pub use proposal::{
    Actor, AutoMerge, Divergence, Endpoint, Flow, InvalidTransition, MergeStyle, Proposal,
    Signature, Status, internal_ref,
};
