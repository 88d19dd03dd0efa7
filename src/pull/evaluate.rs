//! Divergence, mergeability testing, opening, and synchronizing pushes.

use tracing::instrument;

use crate::error::{EngineError, EngineResult};
use crate::git::divergence::{divergence, merge_base};
use crate::git::propagate::{propagate_head, remove_internal_ref};
use crate::git::refs::{commit_summary, commits_between, first_descendant};
use crate::git::resolve::{self, MergeOutcome, changed_paths};
use crate::git::workspace::{BASE, TRACKING, Workspace};
use crate::git::{is_ancestor, resolve_ref};
use crate::persistence::{Changeset, Query};
use crate::policy::ProtectionRule;
use crate::types::{
    Actor, Divergence, Flow, HistoryEntry, HistoryEvent, Proposal, ProposalId, RepoId, Sha,
    Status, UserId,
};

use super::{Engine, InProposal, NewProposal, collect_errors, ensure_open};

impl Engine {
    /// Refreshes the proposal's computed fields from a workspace.
    ///
    /// Sets the head commit, divergence and merge base, test-merges head
    /// into base, and lists protected files the head changes. The status
    /// becomes `Mergeable` or `Conflict`; unrelated histories are recorded
    /// as a conflict with no nameable paths.
    pub(super) fn evaluate(&self, ws: &Workspace, proposal: &mut Proposal) -> EngineResult<()> {
        let id = proposal.id;
        proposal.head_commit = Some(ws.rev(TRACKING).in_proposal(id)?);
        proposal.divergence = divergence(ws).in_proposal(id)?;
        proposal.merge_base = merge_base(ws.path(), BASE, TRACKING).in_proposal(id)?;

        let outcome = resolve::merge(ws.path(), self.strategy, BASE, TRACKING).in_proposal(id)?;
        let status = match outcome {
            MergeOutcome::Clean { .. } => {
                proposal.conflicted_files.clear();
                Status::Mergeable
            }
            MergeOutcome::Conflict { paths } => {
                proposal.conflicted_files = paths;
                Status::Conflict
            }
            MergeOutcome::StructuralFailure => {
                proposal.conflicted_files.clear();
                Status::Conflict
            }
        };

        proposal.changed_protected_files = match (&proposal.merge_base, self.base_rule(proposal)?)
        {
            (Some(base), Some(rule)) if !rule.protected_files.is_empty() => {
                let changed = changed_paths(ws.path(), base.as_str(), TRACKING).in_proposal(id)?;
                rule.protected_paths(&changed)
            }
            _ => Vec::new(),
        };

        tracing::debug!(
            proposal = %id,
            status = %status,
            ahead = proposal.divergence.ahead,
            behind = proposal.divergence.behind,
            conflicts = proposal.conflicted_files.len(),
            "evaluated proposal"
        );
        proposal.transition(status)?;
        Ok(())
    }

    fn base_rule(&self, proposal: &Proposal) -> EngineResult<Option<ProtectionRule>> {
        Ok(self
            .services
            .protection
            .first_matching_rule(&proposal.base.repo, &proposal.base.branch)?)
    }

    /// Ahead/behind counts of an open proposal against its current base.
    pub fn compute_divergence(&self, id: ProposalId) -> EngineResult<Divergence> {
        let proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        let ws = self.workspace(&proposal)?;
        Ok(divergence(&ws).in_proposal(id)?)
    }

    /// Re-tests mergeability and records the result.
    #[instrument(skip(self), fields(proposal = %id))]
    pub fn test_mergeable(&self, id: ProposalId) -> EngineResult<Status> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;

        let ws = self.workspace(&proposal)?;
        self.evaluate(&ws, &mut proposal)?;
        let merged = self.reconcile_merged(&ws, &mut proposal)?;

        let status = proposal.status.clone();
        let mut changes = Changeset::new();
        if let Some(entry) = merged {
            changes.record(entry);
        }
        changes.update(proposal);
        self.store.commit(changes)?;
        Ok(status)
    }

    /// Marks an evaluated proposal merged when its head is already part of
    /// its base: merged by hand, or merged here with the record lost.
    ///
    /// The merge commit is the oldest base commit descending from the head
    /// (the head itself for a fast-forward). It is credited to that
    /// commit's author when the account is known, else to the poster.
    fn reconcile_merged(
        &self,
        ws: &Workspace,
        proposal: &mut Proposal,
    ) -> EngineResult<Option<HistoryEntry>> {
        let id = proposal.id;
        let Some(head) = proposal.head_commit.clone() else {
            return Ok(None);
        };
        if !is_ancestor(ws.path(), TRACKING, BASE).in_proposal(id)? {
            return Ok(None);
        }

        let commit = first_descendant(ws.path(), TRACKING, BASE)
            .in_proposal(id)?
            .unwrap_or(head);
        let author = commit_summary(ws.path(), commit.as_str()).in_proposal(id)?.author;
        let merged_by = self
            .services
            .accounts
            .account_by_email(&author.email)?
            .unwrap_or(proposal.poster.id);

        proposal.transition(Status::Merged {
            commit: commit.clone(),
            merged_by,
            merged_at: chrono::Utc::now(),
        })?;
        proposal.auto_merge = None;

        tracing::info!(proposal = %id, commit = %commit, "head already in base, recording merge");
        Ok(Some(HistoryEntry::now(
            id,
            merged_by,
            HistoryEvent::ManuallyMerged { commit },
        )))
    }

    /// Refreshes every open proposal, picking up pushes no trigger reported.
    ///
    /// Fork-flow heads are re-propagated (a moved head is recorded as pushed
    /// by the poster); every proposal is re-tested against its base, and
    /// one whose head already landed there is recorded as merged. Returns
    /// how many proposals were refreshed.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> EngineResult<usize> {
        let open = self.store.find(&Query::Open)?;

        let mut refreshed = 0;
        let mut errors = Vec::new();
        for proposal in &open {
            let result = match proposal.flow {
                Flow::Fork => self.synchronize(proposal.id, proposal.poster.id, None),
                Flow::DirectRef => self.test_mergeable(proposal.id).map(|_| ()),
            };
            match result {
                Ok(()) => refreshed += 1,
                Err(e) if e.is_already_in_state() => {}
                Err(e) => {
                    tracing::warn!(proposal = %proposal.id, error = %e, "sweep failed");
                    errors.push(e);
                }
            }
        }

        tracing::debug!(open = open.len(), refreshed, "swept open proposals");
        collect_errors(errors).map(|()| refreshed)
    }

    /// Opens a proposal.
    ///
    /// The head is propagated to the new internal ref and evaluated before
    /// anything is stored. If any step fails the internal ref is removed
    /// again and nothing is recorded.
    #[instrument(skip_all, fields(head = %new.head, base = %new.base))]
    pub fn open_proposal(&self, new: NewProposal) -> EngineResult<Proposal> {
        if self
            .services
            .accounts
            .is_blocked(&new.base.repo, new.poster.id, new.poster.id)?
        {
            return Err(EngineError::Blocked {
                actor: new.poster.id,
            });
        }

        let flow = match new.head_commit {
            Some(_) => Flow::DirectRef,
            None => Flow::Fork,
        };
        if flow == Flow::Fork {
            self.ensure_no_equivalent(
                &new.head.repo,
                &new.head.branch,
                &new.base.repo,
                &new.base.branch,
            )?;
        }

        let (id, index) = self.store.next_id(&new.base.repo)?;
        let mut proposal = Proposal {
            id,
            index,
            title: new.title.trim().to_string(),
            description: new.description,
            poster: new.poster,
            head: new.head,
            base: new.base,
            flow,
            status: Status::Checking,
            divergence: Divergence::default(),
            merge_base: None,
            head_commit: None,
            allow_maintainer_edit: new.allow_maintainer_edit,
            conflicted_files: Vec::new(),
            changed_protected_files: Vec::new(),
            auto_merge: None,
            created_at: chrono::Utc::now(),
            version: 0,
        };

        let _guard = self.coordinator.acquire(id);
        if let Err(e) = self.stage_new(&mut proposal, new.head_commit.as_ref()) {
            if let Err(cleanup) = remove_internal_ref(self.git(), &proposal) {
                tracing::warn!(
                    proposal = %id,
                    error = %cleanup,
                    "failed to remove internal ref of abandoned proposal"
                );
            }
            return Err(e);
        }

        tracing::info!(
            proposal = %id,
            index,
            status = %proposal.status,
            ahead = proposal.divergence.ahead,
            behind = proposal.divergence.behind,
            "opened proposal"
        );
        self.proposal(id)
    }

    fn stage_new(&self, proposal: &mut Proposal, head_commit: Option<&Sha>) -> EngineResult<()> {
        let id = proposal.id;
        propagate_head(self.git(), proposal, head_commit)
            .map_err(|e| EngineError::propagate(id, e))?;

        let ws = self.workspace(proposal)?;
        self.evaluate(&ws, proposal)?;
        if proposal.divergence.ahead == 0 {
            return Err(EngineError::BranchesEqual {
                proposal: id,
                branch: proposal.base.branch.clone(),
            });
        }

        let mut changes = Changeset::new();
        changes
            .insert(proposal.clone())
            .record(HistoryEntry::now(id, proposal.poster.id, HistoryEvent::Opened));
        self.store.commit(changes)?;
        Ok(())
    }

    /// Fails with [`EngineError::AlreadyExists`] if an open fork-flow
    /// proposal already joins these endpoints.
    pub(super) fn ensure_no_equivalent(
        &self,
        head_repo: &RepoId,
        head_branch: &str,
        base_repo: &RepoId,
        base_branch: &str,
    ) -> EngineResult<()> {
        let existing = self.store.find(&Query::OpenBetween {
            head_repo: head_repo.clone(),
            head_branch: head_branch.to_string(),
            base_repo: base_repo.clone(),
            base_branch: base_branch.to_string(),
        })?;
        match existing.iter().find(|p| p.flow == Flow::Fork) {
            Some(existing) => Err(EngineError::AlreadyExists {
                existing: existing.id,
                head: format!("{}:{}", head_repo, head_branch),
                base: format!("{}:{}", base_repo, base_branch),
            }),
            None => Ok(()),
        }
    }

    /// Reacts to a push to `repo:branch`.
    ///
    /// Proposals with that head are synchronized (head propagated, pushed
    /// commits recorded, mergeability re-tested). Proposals targeting it
    /// are re-tested. Failures for one proposal do not stop the others; a
    /// head branch that vanished is logged and skipped.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub fn on_branch_pushed(
        &self,
        actor: &Actor,
        repo: &RepoId,
        branch: &str,
    ) -> EngineResult<()> {
        let heads = self.store.find(&Query::OpenByHead {
            repo: repo.clone(),
            branch: branch.to_string(),
        })?;
        let bases = self.store.find(&Query::OpenByBase {
            repo: repo.clone(),
            branch: branch.to_string(),
        })?;

        let mut errors = Vec::new();
        let results = heads
            .iter()
            .filter(|p| p.flow == Flow::Fork)
            .map(|p| (p.id, self.synchronize(p.id, actor.id, None)))
            .chain(bases.iter().map(|p| (p.id, self.test_mergeable(p.id).map(|_| ()))));

        for (id, result) in results {
            match result {
                Ok(()) => {}
                Err(EngineError::BranchNotFound { repo, branch }) => {
                    tracing::warn!(proposal = %id, %repo, %branch, "branch missing, skipping");
                }
                Err(e) if e.is_already_in_state() => {
                    tracing::debug!(proposal = %id, error = %e, "proposal no longer open");
                }
                Err(e) => {
                    tracing::warn!(proposal = %id, error = %e, "failed to refresh proposal");
                    errors.push(e);
                }
            }
        }
        collect_errors(errors)
    }

    /// Moves a direct-ref proposal's head to `commit`, which must already
    /// exist in the base repository.
    #[instrument(skip(self, actor), fields(proposal = %id, actor = %actor.id))]
    pub fn push_direct_ref(
        &self,
        id: ProposalId,
        actor: &Actor,
        commit: &Sha,
    ) -> EngineResult<()> {
        let proposal = self.proposal(id)?;
        if proposal.flow != Flow::DirectRef {
            return Err(EngineError::UnsupportedFlow { proposal: id });
        }
        self.synchronize(id, actor.id, Some(commit))
    }

    /// Propagates the head, re-evaluates, and records the pushed commits.
    fn synchronize(
        &self,
        id: ProposalId,
        actor: UserId,
        commit: Option<&Sha>,
    ) -> EngineResult<()> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        let old_head = proposal.head_commit.clone();

        propagate_head(self.git(), &proposal, commit).map_err(|e| EngineError::propagate(id, e))?;
        let ws = self.workspace(&proposal)?;
        self.evaluate(&ws, &mut proposal)?;
        let merged = self.reconcile_merged(&ws, &mut proposal)?;

        let mut changes = Changeset::new();
        if let Some(entry) = self.pushed_commits(&ws, &proposal, actor, old_head.as_ref())? {
            changes.record(entry);
        }
        if let Some(entry) = merged {
            changes.record(entry);
        }
        changes.update(proposal);
        self.store.commit(changes)?;
        Ok(())
    }

    /// The history entry for the head moving from `old_head` to the
    /// workspace's `tracking`, or `None` if it did not move.
    pub(super) fn pushed_commits(
        &self,
        ws: &Workspace,
        proposal: &Proposal,
        actor: UserId,
        old_head: Option<&Sha>,
    ) -> EngineResult<Option<HistoryEntry>> {
        let id = proposal.id;
        let (Some(old), Some(new)) = (old_head, proposal.head_commit.as_ref()) else {
            return Ok(None);
        };
        if old == new {
            return Ok(None);
        }

        let fast_forward = resolve_ref(ws.path(), old.as_str()).in_proposal(id)?.is_some()
            && is_ancestor(ws.path(), old.as_str(), TRACKING).in_proposal(id)?;
        let commits = if fast_forward {
            commits_between(ws.path(), old.as_str(), TRACKING)
                .in_proposal(id)?
                .into_iter()
                .map(|c| c.sha)
                .collect()
        } else {
            vec![new.clone()]
        };

        tracing::info!(
            proposal = %id,
            commits = commits.len(),
            force = !fast_forward,
            "head moved"
        );
        Ok(Some(HistoryEntry::now(
            id,
            actor,
            HistoryEvent::PushedCommits {
                commits,
                force: !fast_forward,
            },
        )))
    }

    /// Renames a proposal. A title equal to the current one is a no-op.
    #[instrument(skip(self, actor, title), fields(proposal = %id, actor = %actor.id))]
    pub fn change_title(&self, id: ProposalId, actor: &Actor, title: &str) -> EngineResult<()> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        self.ensure_can_edit(&proposal, actor, "change the title")?;

        let title = title.trim();
        if title == proposal.title {
            return Ok(());
        }
        let old = std::mem::replace(&mut proposal.title, title.to_string());

        let mut changes = Changeset::new();
        changes.update(proposal).record(HistoryEntry::now(
            id,
            actor.id,
            HistoryEvent::ChangedTitle {
                old,
                new: title.to_string(),
            },
        ));
        self.store.commit(changes)?;
        Ok(())
    }
}
