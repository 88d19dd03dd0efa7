//! Facts consumed from collaborators, and the decisions built on them.
//!
//! The engine never stores permissions, protection rules, reviews or commit
//! statuses. It asks for them through the traits below, held together in
//! [`Services`]. Lookup failures are errors, never coerced to "denied".
//!
//! - [`gate`]: merge and update-with-base decisions
//! - [`rule`]: branch protection rules and their matching
//! - [`memory`]: an in-process implementation of every trait, loadable from
//!   a JSON file

pub mod gate;
pub mod memory;
pub mod rule;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Proposal, RepoId, Sha, UserId};

pub use gate::{
    GateError, Rejection, UpdatePermission, check_mergeable, is_allowed_to_merge,
    is_allowed_to_update,
};
pub use memory::StaticPolicy;
pub use rule::ProtectionRule;

/// A collaborator lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name} lookup failed: {message}")]
pub struct PolicyError {
    pub source_name: &'static str,
    pub message: String,
}

impl PolicyError {
    pub fn new(source_name: &'static str, message: impl Into<String>) -> Self {
        PolicyError {
            source_name,
            message: message.into(),
        }
    }
}

/// Result type for collaborator lookups.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// An actor's access level on a repository, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    None,
    Read,
    Write,
    Admin,
    Owner,
}

impl AccessMode {
    pub fn can_write(self) -> bool {
        self >= AccessMode::Write
    }

    pub fn is_admin(self) -> bool {
        self >= AccessMode::Admin
    }
}

/// Aggregate state of the checks reported for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn is_success(self) -> bool {
        self == CommitState::Success
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        };
        f.write_str(s)
    }
}

pub trait PermissionSource: Send + Sync {
    fn access_mode(&self, repo: &RepoId, user: UserId) -> PolicyResult<AccessMode>;
}

pub trait ProtectionSource: Send + Sync {
    /// The most specific rule governing `branch`, if any.
    fn first_matching_rule(&self, repo: &RepoId, branch: &str)
    -> PolicyResult<Option<ProtectionRule>>;

    /// Whether the repository lets proposals be updated by rebasing.
    fn allow_rebase_update(&self, repo: &RepoId) -> PolicyResult<bool>;
}

pub trait ReviewSource: Send + Sync {
    /// Approvals that count towards `rule` on the proposal's current head.
    fn approvals(&self, proposal: &Proposal, rule: &ProtectionRule) -> PolicyResult<u32>;
}

pub trait StatusSource: Send + Sync {
    fn combined_state(&self, repo: &RepoId, commit: &Sha) -> PolicyResult<CommitState>;
}

pub trait AccountDirectory: Send + Sync {
    /// Whether `actor` is blocked by the repository owner or by `poster`.
    fn is_blocked(&self, repo: &RepoId, poster: UserId, actor: UserId) -> PolicyResult<bool>;

    /// The account owning a commit email, if one is known.
    fn account_by_email(&self, email: &str) -> PolicyResult<Option<UserId>>;
}

/// The collaborators the engine consults.
#[derive(Clone)]
pub struct Services {
    pub permissions: Arc<dyn PermissionSource>,
    pub protection: Arc<dyn ProtectionSource>,
    pub reviews: Arc<dyn ReviewSource>,
    pub statuses: Arc<dyn StatusSource>,
    pub accounts: Arc<dyn AccountDirectory>,
}

impl Services {
    /// Uses one implementation for every collaborator.
    pub fn uniform<P>(policy: Arc<P>) -> Self
    where
        P: PermissionSource
            + ProtectionSource
            + ReviewSource
            + StatusSource
            + AccountDirectory
            + 'static,
    {
        Services {
            permissions: policy.clone(),
            protection: policy.clone(),
            reviews: policy.clone(),
            statuses: policy.clone(),
            accounts: policy,
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
