//! Engine error type and its handling classification.
//!
//! Every failure the engine surfaces is an [`EngineError`]. Callers decide
//! what to do with it by [`ErrorKind`], never by inspecting messages.

use thiserror::Error;

use crate::git::GitError;
use crate::git::propagate::PropagateError;
use crate::persistence::StoreError;
use crate::policy::{GateError, PolicyError, Rejection};
use crate::types::{InvalidTransition, ProposalId, RepoId, Sha, UserId};

/// How an error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Surface to the user verbatim; never retried automatically.
    UserActionable,

    /// A race that may succeed if the trigger fires again.
    Transient,

    /// The proposal is already in the requested state.
    AlreadyInState,

    /// Unexpected; the operation was aborted.
    Fatal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} does not exist")]
    NotFound(ProposalId),

    #[error("branch {branch} no longer exists in {repo}")]
    BranchNotFound { repo: RepoId, branch: String },

    #[error("{proposal} conflicts in: {}", paths.join(", "))]
    Conflict {
        proposal: ProposalId,
        paths: Vec<String>,
    },

    #[error("applying {commit} conflicts in: {}", paths.join(", "))]
    CherryPickConflict { commit: Sha, paths: Vec<String> },

    #[error("{proposal}: head and base have unrelated histories")]
    UnrelatedHistories { proposal: ProposalId },

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("{proposal} is already merged")]
    AlreadyMerged { proposal: ProposalId },

    #[error("{proposal} is closed")]
    IssueClosed { proposal: ProposalId },

    #[error("{proposal}: branch {branch} already contains the head")]
    BranchesEqual {
        proposal: ProposalId,
        branch: String,
    },

    #[error("an open proposal from {head} into {base} already exists: {existing}")]
    AlreadyExists {
        existing: ProposalId,
        head: String,
        base: String,
    },

    #[error("{proposal} is already up to date with its base")]
    UpToDate { proposal: ProposalId },

    #[error("{actor} is not allowed to {action}")]
    Forbidden { actor: UserId, action: &'static str },

    #[error("{actor} is blocked")]
    Blocked { actor: UserId },

    #[error("{proposal}: operation not supported for direct-ref proposals")]
    UnsupportedFlow { proposal: ProposalId },

    /// A branch moved between the caller observing it and the operation.
    #[error("branch {branch} is at {actual}, expected {expected}")]
    StaleBranch {
        branch: String,
        expected: String,
        actual: String,
    },

    #[error("{proposal}: base is not an ancestor of head, cannot fast-forward")]
    NotFastForward { proposal: ProposalId },

    #[error("{proposal}: propagating head failed: {source}")]
    Propagate {
        proposal: ProposalId,
        #[source]
        source: PropagateError,
    },

    #[error("pushing to {repo}:{branch} failed: {source}")]
    PushBranch {
        repo: RepoId,
        branch: String,
        #[source]
        source: PropagateError,
    },

    #[error("{proposal}: {source}")]
    Git {
        proposal: ProposalId,
        #[source]
        source: GitError,
    },

    #[error(transparent)]
    Vcs(GitError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Several independent operations failed (cascades).
    #[error(
        "{} operations failed; first: {}",
        .0.len(),
        .0.first().map(ToString::to_string).unwrap_or_default()
    )]
    Multiple(Vec<EngineError>),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Wraps a git error with the proposal it concerns.
    ///
    /// Missing branches become [`EngineError::BranchNotFound`] so callers
    /// can treat them as needing attention rather than as crashes.
    pub fn git(proposal: ProposalId, source: GitError) -> Self {
        match source {
            GitError::BranchNotFound { repo, branch } => {
                EngineError::BranchNotFound { repo, branch }
            }
            source => EngineError::Git { proposal, source },
        }
    }

    /// Wraps a failed push to a branch that is not a proposal head.
    pub fn push_branch(repo: &RepoId, branch: &str, source: PropagateError) -> Self {
        match source {
            PropagateError::Git(source) => source.into(),
            source => EngineError::PushBranch {
                repo: repo.clone(),
                branch: branch.to_string(),
                source,
            },
        }
    }

    pub fn propagate(proposal: ProposalId, source: PropagateError) -> Self {
        match source {
            PropagateError::Git(source) => EngineError::git(proposal, source),
            source => EngineError::Propagate { proposal, source },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::AlreadyMerged { .. }
            | EngineError::IssueClosed { .. }
            | EngineError::UpToDate { .. } => ErrorKind::AlreadyInState,

            EngineError::Propagate { source, .. } | EngineError::PushBranch { source, .. } => {
                match source {
                    PropagateError::OutOfDate { .. } | PropagateError::AmbiguousRef { .. } => {
                        ErrorKind::Transient
                    }
                    PropagateError::Rejected { .. } => ErrorKind::UserActionable,
                    PropagateError::Git(_) => ErrorKind::Fatal,
                }
            }

            EngineError::Store(StoreError::VersionConflict { .. }) => ErrorKind::Transient,
            EngineError::Store(StoreError::AlreadyMerged(_)) => ErrorKind::AlreadyInState,
            EngineError::Store(StoreError::NotFound(_)) => ErrorKind::UserActionable,

            EngineError::NotFound(_)
            | EngineError::BranchNotFound { .. }
            | EngineError::Conflict { .. }
            | EngineError::CherryPickConflict { .. }
            | EngineError::UnrelatedHistories { .. }
            | EngineError::Rejected(_)
            | EngineError::BranchesEqual { .. }
            | EngineError::AlreadyExists { .. }
            | EngineError::Forbidden { .. }
            | EngineError::Blocked { .. }
            | EngineError::UnsupportedFlow { .. }
            | EngineError::StaleBranch { .. }
            | EngineError::NotFastForward { .. } => ErrorKind::UserActionable,

            EngineError::Multiple(errors) => errors
                .iter()
                .map(EngineError::kind)
                .min_by_key(|kind| match kind {
                    ErrorKind::Fatal => 0,
                    ErrorKind::Transient => 1,
                    ErrorKind::UserActionable => 2,
                    ErrorKind::AlreadyInState => 3,
                })
                .unwrap_or(ErrorKind::Fatal),

            EngineError::Git { .. }
            | EngineError::Vcs(_)
            | EngineError::Policy(_)
            | EngineError::Store(_)
            | EngineError::InvalidTransition(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_already_in_state(&self) -> bool {
        self.kind() == ErrorKind::AlreadyInState
    }
}

impl From<GitError> for EngineError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::BranchNotFound { repo, branch } => {
                EngineError::BranchNotFound { repo, branch }
            }
            e => EngineError::Vcs(e),
        }
    }
}

impl From<GateError> for EngineError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Rejected(r) => EngineError::Rejected(r),
            GateError::Policy(p) => EngineError::Policy(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_branch_is_user_actionable() {
        let err = EngineError::git(
            ProposalId(1),
            GitError::BranchNotFound {
                repo: RepoId::new("acme", "upstream"),
                branch: "feat".to_string(),
            },
        );
        assert!(matches!(err, EngineError::BranchNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::UserActionable);
    }

    #[test]
    fn push_failures_are_classified_by_variant() {
        let transient = EngineError::propagate(
            ProposalId(1),
            PropagateError::OutOfDate {
                stderr: String::new(),
            },
        );
        assert_eq!(transient.kind(), ErrorKind::Transient);

        let rejected = EngineError::propagate(
            ProposalId(1),
            PropagateError::Rejected {
                stdout: String::new(),
                stderr: "hook declined".to_string(),
            },
        );
        assert_eq!(rejected.kind(), ErrorKind::UserActionable);

        let io = EngineError::propagate(
            ProposalId(1),
            PropagateError::Git(GitError::Io(std::io::Error::other("no git"))),
        );
        assert!(matches!(io, EngineError::Git { .. }));
        assert_eq!(io.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn already_in_state_errors() {
        assert!(EngineError::AlreadyMerged {
            proposal: ProposalId(1)
        }
        .is_already_in_state());
        assert!(EngineError::Store(StoreError::AlreadyMerged(ProposalId(1))).is_already_in_state());
        assert!(!EngineError::NotFound(ProposalId(1)).is_already_in_state());
    }

    #[test]
    fn multiple_reports_most_severe_kind() {
        let err = EngineError::Multiple(vec![
            EngineError::UpToDate {
                proposal: ProposalId(1),
            },
            EngineError::Vcs(GitError::Workspace {
                details: "disk full".to_string(),
            }),
        ]);
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().starts_with("2 operations failed"));
    }
}
