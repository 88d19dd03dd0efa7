//! Pull Integrator - merges, updates and retargets pull requests between git
//! branches and forks.
//!
//! This library provides the integration engine: divergence and
//! mergeability testing in disposable workspaces, the merge styles, head
//! updates, branch retargeting cascades, and the triggers that drive them.

pub mod config;
pub mod error;
pub mod git;
pub mod persistence;
pub mod policy;
pub mod pull;
pub mod squash;
pub mod trigger;
pub mod types;

#[cfg(test)]
pub mod test_utils;
