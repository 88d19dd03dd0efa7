//! A store held entirely in memory.

use std::sync::{PoisonError, RwLock};

use crate::types::{HistoryEntry, Proposal, ProposalId, RepoId};

use super::store::{Changeset, ProposalStore, Query, StoreResult, StoreState};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// Every critical section validates before mutating, so a poisoned lock
// still guards consistent state.
impl ProposalStore for MemoryStore {
    fn load(&self, id: ProposalId) -> StoreResult<Proposal> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .load(id)
    }

    fn find(&self, query: &Query) -> StoreResult<Vec<Proposal>> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(query))
    }

    fn next_id(&self, repo: &RepoId) -> StoreResult<(ProposalId, u64)> {
        Ok(self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id(repo))
    }

    fn commit(&self, changes: Changeset) -> StoreResult<()> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(changes)
    }

    fn history(&self, id: ProposalId) -> StoreResult<Vec<HistoryEntry>> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreError;
    use crate::test_utils::sample_proposal;
    use crate::types::{HistoryEvent, UserId};

    #[test]
    fn commit_bumps_version_and_appends_history() {
        let store = MemoryStore::new();
        let mut changes = Changeset::new();
        changes
            .insert(sample_proposal(1, "feat", "main"))
            .record(HistoryEntry::now(ProposalId(1), UserId(1), HistoryEvent::Opened));
        store.commit(changes).unwrap();

        let mut p = store.load(ProposalId(1)).unwrap();
        assert_eq!(p.version, 1);
        p.title = "Renamed".to_string();

        let mut changes = Changeset::new();
        changes.update(p.clone());
        store.commit(changes).unwrap();
        assert_eq!(store.load(ProposalId(1)).unwrap().version, 2);

        // Reusing the stale copy fails.
        let mut changes = Changeset::new();
        changes.update(p);
        assert!(matches!(
            store.commit(changes),
            Err(StoreError::VersionConflict { .. })
        ));

        assert_eq!(store.history(ProposalId(1)).unwrap().len(), 1);
        assert!(matches!(
            store.load(ProposalId(7)),
            Err(StoreError::NotFound(ProposalId(7)))
        ));
    }
}
