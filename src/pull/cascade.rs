//! Target branch changes and the cascades that follow branch moves.
//!
//! When a merged branch is deleted, proposals stacked on it are retargeted
//! to where it was merged and proposals from it are closed. A branch deleted
//! without a merge closes everything that points at it.

use tracing::instrument;

use crate::error::{EngineError, EngineResult};
use crate::git::workspace::{BASE, TRACKING};
use crate::git::{branch_exists, is_ancestor};
use crate::persistence::{Changeset, Query};
use crate::types::{Actor, HistoryEntry, HistoryEvent, Proposal, ProposalId, RepoId, Status};

use super::{Engine, InProposal, collect_errors, ensure_open};

impl Engine {
    /// Changes the base branch of an open proposal within its base
    /// repository.
    ///
    /// Changing to the current base is a no-op whatever the proposal's
    /// state. Otherwise merged and closed proposals are refused before
    /// anything else is looked at and are never modified.
    #[instrument(skip(self, actor), fields(proposal = %id, actor = %actor.id))]
    pub fn change_target(
        &self,
        id: ProposalId,
        actor: &Actor,
        new_branch: &str,
    ) -> EngineResult<()> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        if proposal.base.branch == new_branch {
            tracing::debug!(proposal = %id, "target unchanged");
            return Ok(());
        }
        ensure_open(&proposal)?;
        self.ensure_can_edit(&proposal, actor, "change the target branch")?;

        let base_path = self.git().repo_path(&proposal.base.repo);
        if !branch_exists(&base_path, new_branch).in_proposal(id)? {
            return Err(EngineError::BranchNotFound {
                repo: proposal.base.repo.clone(),
                branch: new_branch.to_string(),
            });
        }
        self.ensure_no_equivalent(
            &proposal.head.repo,
            &proposal.head.branch,
            &proposal.base.repo,
            new_branch,
        )?;

        let old = std::mem::replace(&mut proposal.base.branch, new_branch.to_string());
        let ws = self.workspace(&proposal)?;
        if is_ancestor(ws.path(), TRACKING, BASE).in_proposal(id)? {
            return Err(EngineError::BranchesEqual {
                proposal: id,
                branch: new_branch.to_string(),
            });
        }
        self.evaluate(&ws, &mut proposal)?;

        let mut changes = Changeset::new();
        changes.update(proposal).record(HistoryEntry::now(
            id,
            actor.id,
            HistoryEvent::ChangedTargetBranch {
                old: old.clone(),
                new: new_branch.to_string(),
            },
        ));
        self.store.commit(changes)?;

        tracing::info!(proposal = %id, %old, new = %new_branch, "changed target branch");
        Ok(())
    }

    /// Retargets every open proposal based on `repo:old` to `repo:new`.
    ///
    /// Proposals that are no longer open, or whose retargeted form already
    /// exists, are skipped. Other failures are collected and returned once
    /// every proposal was attempted.
    pub fn retarget_children(
        &self,
        actor: &Actor,
        repo: &RepoId,
        old: &str,
        new: &str,
    ) -> EngineResult<()> {
        self.retarget_where(actor, repo, old, new, |_| true)
    }

    /// Moves proposals stacked on a merged proposal's head onto its base.
    ///
    /// Only applies to same-repository proposals, and only to children
    /// whose head lives in that repository too.
    pub fn retarget_children_on_merge(
        &self,
        actor: &Actor,
        merged: &Proposal,
    ) -> EngineResult<()> {
        if !self.config.retarget_on_merge || !merged.is_same_repo() {
            return Ok(());
        }
        self.retarget_where(
            actor,
            &merged.head.repo,
            &merged.head.branch,
            &merged.base.branch,
            |child| child.head.repo == merged.head.repo,
        )
    }

    fn retarget_where(
        &self,
        actor: &Actor,
        repo: &RepoId,
        old: &str,
        new: &str,
        filter: impl Fn(&Proposal) -> bool,
    ) -> EngineResult<()> {
        let children = self.store.find(&Query::OpenByBase {
            repo: repo.clone(),
            branch: old.to_string(),
        })?;

        let mut errors = Vec::new();
        for child in children.iter().filter(|child| filter(child)) {
            match self.change_target(child.id, actor, new) {
                Ok(()) => {}
                Err(
                    e @ (EngineError::IssueClosed { .. }
                    | EngineError::AlreadyMerged { .. }
                    | EngineError::AlreadyExists { .. }),
                ) => {
                    tracing::debug!(proposal = %child.id, error = %e, "not retargeting");
                }
                Err(e) => {
                    tracing::warn!(proposal = %child.id, error = %e, "retarget failed");
                    errors.push(e);
                }
            }
        }
        collect_errors(errors)
    }

    /// Closes every open proposal whose head or base is `repo:branch`,
    /// typically because the branch was deleted without a merge.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub fn close_branch_pulls(
        &self,
        actor: &Actor,
        repo: &RepoId,
        branch: &str,
    ) -> EngineResult<()> {
        let mut targets = self.store.find(&Query::OpenByHead {
            repo: repo.clone(),
            branch: branch.to_string(),
        })?;
        targets.extend(self.store.find(&Query::OpenByBase {
            repo: repo.clone(),
            branch: branch.to_string(),
        })?);
        targets.sort_by_key(|p| p.id);
        targets.dedup_by_key(|p| p.id);
        self.close_all(actor, &targets)
    }

    /// Closes the open proposals whose head is `repo:branch`. Proposals
    /// based on it are left to the retarget cascade.
    pub(super) fn close_head_pulls(
        &self,
        actor: &Actor,
        repo: &RepoId,
        branch: &str,
    ) -> EngineResult<()> {
        let targets = self.store.find(&Query::OpenByHead {
            repo: repo.clone(),
            branch: branch.to_string(),
        })?;
        self.close_all(actor, &targets)
    }

    fn close_all(&self, actor: &Actor, targets: &[Proposal]) -> EngineResult<()> {
        let mut errors = Vec::new();
        for target in targets {
            match self.close(target.id, actor) {
                Ok(()) => {}
                Err(e) if e.is_already_in_state() => {}
                Err(e) => {
                    tracing::warn!(proposal = %target.id, error = %e, "close failed");
                    errors.push(e);
                }
            }
        }
        collect_errors(errors)
    }

    fn close(&self, id: ProposalId, actor: &Actor) -> EngineResult<()> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;

        proposal.transition(Status::Closed)?;
        proposal.auto_merge = None;

        let mut changes = Changeset::new();
        changes
            .update(proposal)
            .record(HistoryEntry::now(id, actor.id, HistoryEvent::Closed));
        self.store.commit(changes)?;

        tracing::info!(proposal = %id, "closed proposal");
        Ok(())
    }
}
