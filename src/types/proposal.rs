//! Proposal (pull request) types and state representations.
//!
//! The status field is an explicit state machine. Every mutation goes through
//! [`Proposal::transition`], which consults [`Status::can_transition_to`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{ProposalId, RepoId, Sha, UserId};

/// How head commits are made visible in the base repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Head lives on a branch (possibly in a fork); it is force-pushed into the
    /// base repository's internal ref.
    Fork,
    /// Head only exists as the internal ref, which is updated in place.
    DirectRef,
}

/// One side of a proposal: a branch in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub repo: RepoId,
    pub branch: String,
}

impl Endpoint {
    pub fn new(repo: RepoId, branch: impl Into<String>) -> Self {
        Endpoint {
            repo,
            branch: branch.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.branch)
    }
}

/// A user acting on proposals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

impl Actor {
    pub fn new(id: u64, name: impl Into<String>, email: impl Into<String>) -> Self {
        Actor {
            id: UserId(id),
            name: name.into(),
            email: email.into(),
        }
    }

    /// The git signature used when this actor authors or commits.
    pub fn signature(&self) -> Signature {
        Signature {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// A git author/committer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Ahead/behind commit counts between head and base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub ahead: u64,
    pub behind: u64,
}

/// How a proposal is merged into its base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStyle {
    /// Two-parent merge commit.
    Merge,
    /// Single commit on top of base with the combined tree.
    Squash,
    /// Replay every head commit on top of base, then fast-forward.
    Rebase,
    /// Replay head commits, then create a merge commit.
    RebaseMerge,
    /// Only succeed when base is an ancestor of head.
    FastForwardOnly,
}

impl fmt::Display for MergeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeStyle::Merge => "merge",
            MergeStyle::Squash => "squash",
            MergeStyle::Rebase => "rebase",
            MergeStyle::RebaseMerge => "rebase-merge",
            MergeStyle::FastForwardOnly => "fast-forward-only",
        };
        f.write_str(s)
    }
}

/// The lifecycle state of a proposal.
///
/// `Checking`, `Mergeable` and `Conflict` are the open states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    /// Open; mergeability not yet known for the current endpoints.
    Checking,
    /// Open; the last test merge was clean.
    Mergeable,
    /// Open; the last test merge conflicted.
    Conflict,
    /// Merged. The merged commit is required.
    Merged {
        commit: Sha,
        merged_by: UserId,
        merged_at: DateTime<Utc>,
    },
    /// Closed without merging.
    Closed,
}

impl Status {
    pub fn is_open(&self) -> bool {
        matches!(self, Status::Checking | Status::Mergeable | Status::Conflict)
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Status::Merged { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Status::Closed)
    }

    pub fn merged_commit(&self) -> Option<&Sha> {
        match self {
            Status::Merged { commit, .. } => Some(commit),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Checking => "checking",
            Status::Mergeable => "mergeable",
            Status::Conflict => "conflict",
            Status::Merged { .. } => "merged",
            Status::Closed => "closed",
        }
    }

    /// The transition table.
    ///
    /// Open states move freely among themselves and into `Merged` or `Closed`.
    /// `Closed` may only reopen into `Checking`. `Merged` is terminal.
    pub fn can_transition_to(&self, to: &Status) -> bool {
        match (self, to) {
            (Status::Merged { .. }, _) => false,
            (Status::Closed, Status::Checking) => true,
            (Status::Closed, _) => false,
            (_, _) => true,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attempted a status change the transition table forbids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{proposal}: invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub proposal: ProposalId,
    pub from: &'static str,
    pub to: &'static str,
}

/// A merge requested to happen once checks on the head commit succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMerge {
    pub actor: Actor,
    pub style: MergeStyle,
    pub message: String,
    pub delete_branch: bool,
}

/// A proposal to integrate `head` into `base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,

    /// Per-base-repository number; names the internal ref.
    pub index: u64,

    pub title: String,
    pub description: String,
    pub poster: Actor,

    pub head: Endpoint,
    pub base: Endpoint,
    pub flow: Flow,

    pub status: Status,

    pub divergence: Divergence,
    pub merge_base: Option<Sha>,

    /// Tip of the head as last propagated into the base repository.
    pub head_commit: Option<Sha>,

    pub allow_maintainer_edit: bool,

    #[serde(default)]
    pub conflicted_files: Vec<String>,

    #[serde(default)]
    pub changed_protected_files: Vec<String>,

    #[serde(default)]
    pub auto_merge: Option<AutoMerge>,

    pub created_at: DateTime<Utc>,

    /// Bumped by the store on every committed update.
    #[serde(default)]
    pub version: u64,
}

impl Proposal {
    /// The ref in the base repository that holds the proposal head.
    pub fn internal_ref(&self, prefix: &str) -> String {
        internal_ref(prefix, self.index)
    }

    pub fn is_same_repo(&self) -> bool {
        self.head.repo == self.base.repo
    }

    /// Whether the title marks the proposal as not ready to merge.
    pub fn is_work_in_progress(&self, prefixes: &[String]) -> bool {
        let title = self.title.trim_start().to_lowercase();
        prefixes
            .iter()
            .any(|prefix| title.starts_with(&prefix.to_lowercase()))
    }

    /// Moves to `to`, validating against the transition table.
    pub fn transition(&mut self, to: Status) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(&to) {
            return Err(InvalidTransition {
                proposal: self.id,
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Name of the internal ref for a proposal index.
pub fn internal_ref(prefix: &str, index: u64) -> String {
    format!("refs/{}/{}/head", prefix, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_sha, arb_status, sample_proposal};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn status_serde_roundtrip(status in arb_status()) {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: Status = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(status, parsed);
        }

        #[test]
        fn exactly_one_lifecycle_state(status in arb_status()) {
            let states = [status.is_open(), status.is_closed(), status.is_merged()];
            prop_assert_eq!(states.iter().filter(|s| **s).count(), 1);
        }

        #[test]
        fn merged_is_terminal(sha in arb_sha(), to in arb_status()) {
            let merged = Status::Merged {
                commit: sha,
                merged_by: UserId(1),
                merged_at: Utc::now(),
            };
            prop_assert!(!merged.can_transition_to(&to));
        }
    }

    #[test]
    fn closed_only_reopens_to_checking() {
        assert!(Status::Closed.can_transition_to(&Status::Checking));
        assert!(!Status::Closed.can_transition_to(&Status::Mergeable));
        assert!(!Status::Closed.can_transition_to(&Status::Closed));
    }

    #[test]
    fn transition_rejects_leaving_merged() {
        let mut pr = sample_proposal(1, "feat", "main");
        pr.transition(Status::Merged {
            commit: Sha::parse("a".repeat(40)).unwrap(),
            merged_by: UserId(1),
            merged_at: Utc::now(),
        })
        .unwrap();

        let err = pr.transition(Status::Closed).unwrap_err();
        assert_eq!(err.from, "merged");
        assert_eq!(err.to, "closed");
        assert!(pr.status.is_merged());
    }

    #[test]
    fn work_in_progress_prefixes_are_case_insensitive() {
        let prefixes = vec!["WIP:".to_string(), "[WIP]".to_string()];
        let mut pr = sample_proposal(1, "feat", "main");

        pr.title = "wip: not yet".to_string();
        assert!(pr.is_work_in_progress(&prefixes));

        pr.title = "  [WIP] later".to_string();
        assert!(pr.is_work_in_progress(&prefixes));

        pr.title = "Ready: WIP: in the middle".to_string();
        assert!(!pr.is_work_in_progress(&prefixes));
    }

    #[test]
    fn internal_ref_name() {
        let mut pr = sample_proposal(7, "feat", "main");
        pr.index = 12;
        assert_eq!(pr.internal_ref("pull"), "refs/pull/12/head");
    }
}
