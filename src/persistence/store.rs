//! The proposal store contract.
//!
//! Writes are staged in a [`Changeset`] and applied all-or-nothing by
//! [`ProposalStore::commit`]. The engine builds the changeset while it works
//! and only commits once ref propagation has succeeded, so a failed push
//! leaves no state behind.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HistoryEntry, Proposal, ProposalId, RepoId, Sha};

/// Errors from the proposal store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} does not exist")]
    NotFound(ProposalId),

    /// The row changed since it was loaded.
    #[error("{proposal} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        proposal: ProposalId,
        expected: u64,
        actual: u64,
    },

    /// A guarded update found the row already merged.
    #[error("{0} is already merged")]
    AlreadyMerged(ProposalId),

    #[error("{0} already exists")]
    Duplicate(ProposalId),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Selects proposals by endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every open proposal.
    Open,

    /// Open proposals targeting `repo:branch`.
    OpenByBase { repo: RepoId, branch: String },

    /// Open proposals whose head is `repo:branch`.
    OpenByHead { repo: RepoId, branch: String },

    /// Open proposals between exactly these endpoints.
    OpenBetween {
        head_repo: RepoId,
        head_branch: String,
        base_repo: RepoId,
        base_branch: String,
    },

    /// Open proposals in `repo` with a pending auto-merge on `commit`.
    AutoMergeOnCommit { repo: RepoId, commit: Sha },
}

impl Query {
    pub fn matches(&self, p: &Proposal) -> bool {
        if !p.status.is_open() {
            return false;
        }
        match self {
            Query::Open => true,
            Query::OpenByBase { repo, branch } => p.base.repo == *repo && p.base.branch == *branch,
            Query::OpenByHead { repo, branch } => p.head.repo == *repo && p.head.branch == *branch,
            Query::OpenBetween {
                head_repo,
                head_branch,
                base_repo,
                base_branch,
            } => {
                p.head.repo == *head_repo
                    && p.head.branch == *head_branch
                    && p.base.repo == *base_repo
                    && p.base.branch == *base_branch
            }
            Query::AutoMergeOnCommit { repo, commit } => {
                p.base.repo == *repo
                    && p.auto_merge.is_some()
                    && p.head_commit.as_ref() == Some(commit)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StagedUpdate {
    proposal: Proposal,
    expected_version: u64,
    unless_merged: bool,
}

/// Writes applied together by [`ProposalStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    inserts: Vec<Proposal>,
    updates: Vec<StagedUpdate>,
    history: Vec<HistoryEntry>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, proposal: Proposal) -> &mut Self {
        self.inserts.push(proposal);
        self
    }

    /// Replaces the row, provided it is still at `proposal.version`.
    pub fn update(&mut self, proposal: Proposal) -> &mut Self {
        self.stage(proposal, false)
    }

    /// Like [`Changeset::update`], but fails with
    /// [`StoreError::AlreadyMerged`] if the stored row is merged.
    pub fn update_unless_merged(&mut self, proposal: Proposal) -> &mut Self {
        self.stage(proposal, true)
    }

    pub fn record(&mut self, entry: HistoryEntry) -> &mut Self {
        self.history.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.history.is_empty()
    }

    fn stage(&mut self, proposal: Proposal, unless_merged: bool) -> &mut Self {
        self.updates.push(StagedUpdate {
            expected_version: proposal.version,
            proposal,
            unless_merged,
        });
        self
    }
}

/// Durable storage of proposal rows and their history.
pub trait ProposalStore: Send + Sync {
    fn load(&self, id: ProposalId) -> StoreResult<Proposal>;

    fn find(&self, query: &Query) -> StoreResult<Vec<Proposal>>;

    /// Reserves a fresh id and the next per-repository index for `repo`.
    fn next_id(&self, repo: &RepoId) -> StoreResult<(ProposalId, u64)>;

    /// Applies every write in the changeset, or none of them.
    fn commit(&self, changes: Changeset) -> StoreResult<()>;

    /// History of a proposal, oldest first.
    fn history(&self, id: ProposalId) -> StoreResult<Vec<HistoryEntry>>;
}

/// The complete store contents, shared by the implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub proposals: BTreeMap<ProposalId, Proposal>,
    pub history: Vec<HistoryEntry>,
    pub last_id: u64,
    /// Last issued index per base repository, keyed by `owner/repo`.
    pub last_index: BTreeMap<String, u64>,
}

impl StoreState {
    pub fn load(&self, id: ProposalId) -> StoreResult<Proposal> {
        self.proposals
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn find(&self, query: &Query) -> Vec<Proposal> {
        self.proposals
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect()
    }

    pub fn next_id(&mut self, repo: &RepoId) -> (ProposalId, u64) {
        self.last_id += 1;
        let index = self.last_index.entry(repo.to_string()).or_insert(0);
        *index += 1;
        (ProposalId(self.last_id), *index)
    }

    pub fn history(&self, id: ProposalId) -> Vec<HistoryEntry> {
        self.history
            .iter()
            .filter(|h| h.proposal == id)
            .cloned()
            .collect()
    }

    /// Validates the whole changeset first, then applies it.
    pub fn apply(&mut self, changes: Changeset) -> StoreResult<()> {
        for p in &changes.inserts {
            if self.proposals.contains_key(&p.id) {
                return Err(StoreError::Duplicate(p.id));
            }
        }
        for staged in &changes.updates {
            let id = staged.proposal.id;
            let stored = self.proposals.get(&id).ok_or(StoreError::NotFound(id))?;
            if staged.unless_merged && stored.status.is_merged() {
                return Err(StoreError::AlreadyMerged(id));
            }
            if stored.version != staged.expected_version {
                return Err(StoreError::VersionConflict {
                    proposal: id,
                    expected: staged.expected_version,
                    actual: stored.version,
                });
            }
        }

        for mut p in changes.inserts {
            p.version = 1;
            self.last_id = self.last_id.max(p.id.0);
            let index = self.last_index.entry(p.base.repo.to_string()).or_insert(0);
            *index = (*index).max(p.index);
            self.proposals.insert(p.id, p);
        }
        for staged in changes.updates {
            let mut p = staged.proposal;
            p.version = staged.expected_version + 1;
            self.proposals.insert(p.id, p);
        }
        self.history.extend(changes.history);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_proposal;
    use crate::types::{HistoryEvent, Status, UserId};
    use chrono::Utc;

    fn merged(mut p: Proposal) -> Proposal {
        p.status = Status::Merged {
            commit: Sha::parse("b".repeat(40)).unwrap(),
            merged_by: UserId(2),
            merged_at: Utc::now(),
        };
        p
    }

    #[test]
    fn failed_changeset_applies_nothing() {
        let mut state = StoreState::default();
        let mut changes = Changeset::new();
        changes.insert(sample_proposal(1, "a", "main"));
        state.apply(changes).unwrap();

        let mut changes = Changeset::new();
        changes
            .insert(sample_proposal(2, "b", "main"))
            .update(sample_proposal(1, "a", "dev"))
            .record(HistoryEntry::now(ProposalId(1), UserId(1), HistoryEvent::Closed));

        // version 0 staged against stored version 1
        let err = state.apply(changes).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(state.proposals.len(), 1);
        assert!(state.history.is_empty());
        assert_eq!(state.load(ProposalId(1)).unwrap().base.branch, "main");
    }

    #[test]
    fn update_unless_merged_guard() {
        let mut state = StoreState::default();
        let mut changes = Changeset::new();
        changes.insert(sample_proposal(1, "a", "main"));
        state.apply(changes).unwrap();

        let loaded = state.load(ProposalId(1)).unwrap();
        let mut changes = Changeset::new();
        changes.update_unless_merged(merged(loaded.clone()));
        state.apply(changes).unwrap();
        assert_eq!(state.load(ProposalId(1)).unwrap().version, 2);

        // A stale copy racing the first merge.
        let mut changes = Changeset::new();
        changes.update_unless_merged(merged(loaded));
        assert!(matches!(
            state.apply(changes),
            Err(StoreError::AlreadyMerged(ProposalId(1)))
        ));
    }

    #[test]
    fn ids_and_indexes_are_monotonic_per_repo() {
        let mut state = StoreState::default();
        let upstream = RepoId::new("acme", "upstream");
        let other = RepoId::new("acme", "other");

        assert_eq!(state.next_id(&upstream), (ProposalId(1), 1));
        assert_eq!(state.next_id(&upstream), (ProposalId(2), 2));
        assert_eq!(state.next_id(&other), (ProposalId(3), 1));

        let mut changes = Changeset::new();
        changes.insert(sample_proposal(10, "a", "main"));
        state.apply(changes).unwrap();
        assert_eq!(state.next_id(&upstream), (ProposalId(11), 11));
    }

    #[test]
    fn queries_only_return_open_proposals() {
        let mut state = StoreState::default();
        let mut closed = sample_proposal(2, "b", "main");
        closed.status = Status::Closed;
        let mut changes = Changeset::new();
        changes
            .insert(sample_proposal(1, "a", "main"))
            .insert(closed)
            .insert(merged(sample_proposal(3, "c", "main")));
        state.apply(changes).unwrap();

        let by_base = state.find(&Query::OpenByBase {
            repo: RepoId::new("acme", "upstream"),
            branch: "main".to_string(),
        });
        assert_eq!(by_base.len(), 1);
        assert_eq!(by_base[0].id, ProposalId(1));
        assert_eq!(state.find(&Query::Open).len(), 1);
    }
}
