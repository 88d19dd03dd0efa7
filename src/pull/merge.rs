//! Merging proposals.
//!
//! The merged commit is built in a workspace and pushed to the base branch
//! without force, so a base that moved since the workspace fetched it
//! fails the merge instead of losing commits. The proposal is only marked
//! merged once that push landed.

use std::collections::HashMap;

use tracing::instrument;

use crate::error::{EngineError, EngineResult};
use crate::git::divergence::merge_base;
use crate::git::propagate::{delete_branch, push_commit};
use crate::git::refs::{commit_summary, commits_between, commits_to_replay};
use crate::git::resolve::{self, MergeOutcome};
use crate::git::workspace::{BASE, TRACKING, Workspace};
use crate::git::{commit_tree, get_tree_sha, is_ancestor, resolve_ref};
use crate::persistence::{Changeset, Query};
use crate::policy::{Rejection, check_mergeable, is_allowed_to_merge};
use crate::squash::{SquashInput, compose_squash_message};
use crate::types::{
    Actor, AutoMerge, Flow, HistoryEntry, HistoryEvent, MergeStyle, Proposal, ProposalId, RepoId,
    Sha, Signature, Status,
};

use super::{Engine, InProposal, MergeRequest, ensure_open};

impl Engine {
    /// Merges a proposal into its base branch and returns the new base tip.
    ///
    /// Exactly one of several concurrent merges of the same proposal
    /// succeeds; the others observe it merged and fail with
    /// [`EngineError::AlreadyMerged`].
    #[instrument(
        skip(self, actor, request),
        fields(proposal = %id, actor = %actor.id, style = %request.style)
    )]
    pub fn merge(
        &self,
        id: ProposalId,
        actor: &Actor,
        request: &MergeRequest,
    ) -> EngineResult<Sha> {
        let (merged, commit) = {
            let _guard = self.coordinator.acquire(id);
            self.merge_locked(id, actor, request)?
        };

        // Runs unlocked: the follow-ups lock other proposals.
        self.after_merge(&merged, actor, request);
        Ok(commit)
    }

    fn merge_locked(
        &self,
        id: ProposalId,
        actor: &Actor,
        request: &MergeRequest,
    ) -> EngineResult<(Proposal, Sha)> {
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        check_mergeable(
            &self.services,
            &proposal,
            actor.id,
            &self.config.wip_prefixes,
            request.force,
        )?;

        let ws = self.workspace(&proposal)?;
        let head = ws.rev(TRACKING).in_proposal(id)?;
        if let Some(expected) = &request.expected_head
            && *expected != head
        {
            return Err(EngineError::StaleBranch {
                branch: proposal.head.branch.clone(),
                expected: expected.to_string(),
                actual: head.to_string(),
            });
        }
        // The recorded mergeability must describe this head.
        if proposal.head_commit.as_ref() != Some(&head) {
            return Err(Rejection::StillChecking.into());
        }

        let commit = self.materialize(&ws, &proposal, actor, request)?;
        let base_path = self.git().repo_path(&proposal.base.repo);
        push_commit(ws.path(), &base_path, &commit, &proposal.base.branch, None)
            .map_err(|e| EngineError::propagate(id, e))?;

        proposal.transition(Status::Merged {
            commit: commit.clone(),
            merged_by: actor.id,
            merged_at: chrono::Utc::now(),
        })?;
        proposal.auto_merge = None;

        let mut changes = Changeset::new();
        changes.update_unless_merged(proposal.clone()).record(HistoryEntry::now(
            id,
            actor.id,
            HistoryEvent::Merged {
                commit: commit.clone(),
                style: request.style,
            },
        ));
        if let Err(e) = self.store.commit(changes) {
            tracing::error!(
                proposal = %id,
                commit = %commit,
                error = %e,
                "merge pushed but not recorded"
            );
            return Err(e.into());
        }

        tracing::info!(
            proposal = %id,
            commit = %commit,
            base = %proposal.base,
            "merged proposal"
        );
        Ok((proposal, commit))
    }

    /// Builds the commit the base branch will point at.
    fn materialize(
        &self,
        ws: &Workspace,
        proposal: &Proposal,
        actor: &Actor,
        request: &MergeRequest,
    ) -> EngineResult<Sha> {
        let id = proposal.id;
        if merge_base(ws.path(), BASE, TRACKING).in_proposal(id)?.is_none() {
            return Err(EngineError::UnrelatedHistories { proposal: id });
        }

        let base = ws.rev(BASE).in_proposal(id)?;
        let head = ws.rev(TRACKING).in_proposal(id)?;
        let committer = self.committer(actor);
        let message = if request.message.trim().is_empty() {
            self.default_message(ws, proposal, request.style)?
        } else {
            request.message.clone()
        };

        let commit = match request.style {
            MergeStyle::Merge => {
                let tree = self.merged_tree(ws, id, BASE, TRACKING)?;
                commit_tree(
                    ws.path(),
                    &tree,
                    &[&base, &head],
                    &message,
                    &actor.signature(),
                    &committer,
                )
            }
            MergeStyle::Squash => {
                let tree = self.merged_tree(ws, id, BASE, TRACKING)?;
                commit_tree(
                    ws.path(),
                    &tree,
                    &[&base],
                    &message,
                    &proposal.poster.signature(),
                    &committer,
                )
            }
            MergeStyle::Rebase => return self.replay(ws, id, &base, TRACKING, &committer),
            MergeStyle::RebaseMerge => {
                let tip = self.replay(ws, id, &base, TRACKING, &committer)?;
                let tree = get_tree_sha(ws.path(), tip.as_str()).in_proposal(id)?;
                commit_tree(
                    ws.path(),
                    &tree,
                    &[&base, &tip],
                    &message,
                    &actor.signature(),
                    &committer,
                )
            }
            MergeStyle::FastForwardOnly => {
                if !is_ancestor(ws.path(), BASE, TRACKING).in_proposal(id)? {
                    return Err(EngineError::NotFastForward { proposal: id });
                }
                return Ok(head);
            }
        };
        commit.in_proposal(id)
    }

    /// Three-way merges `theirs` into `ours`, failing on conflicts.
    pub(super) fn merged_tree(
        &self,
        ws: &Workspace,
        id: ProposalId,
        ours: &str,
        theirs: &str,
    ) -> EngineResult<Sha> {
        match resolve::merge(ws.path(), self.strategy, ours, theirs).in_proposal(id)? {
            MergeOutcome::Clean { tree } => Ok(tree),
            MergeOutcome::Conflict { paths } => {
                Err(EngineError::Conflict { proposal: id, paths })
            }
            MergeOutcome::StructuralFailure => {
                Err(EngineError::UnrelatedHistories { proposal: id })
            }
        }
    }

    /// Replays the non-merge commits of `onto..head` on top of `onto`,
    /// keeping each commit's author and message. When `onto` is already an
    /// ancestor of `head` nothing is rewritten and `head` is returned.
    pub(super) fn replay(
        &self,
        ws: &Workspace,
        id: ProposalId,
        onto: &Sha,
        head: &str,
        committer: &Signature,
    ) -> EngineResult<Sha> {
        if is_ancestor(ws.path(), onto.as_str(), head).in_proposal(id)? {
            return ws.rev(head).in_proposal(id);
        }

        let mut tip = onto.clone();
        for commit in commits_to_replay(ws.path(), onto.as_str(), head).in_proposal(id)? {
            let outcome =
                resolve::cherry_pick(ws.path(), self.strategy, tip.as_str(), commit.as_str())
                    .in_proposal(id)?;
            let tree = match outcome {
                MergeOutcome::Clean { tree } => tree,
                MergeOutcome::Conflict { paths } => {
                    return Err(EngineError::Conflict { proposal: id, paths });
                }
                MergeOutcome::StructuralFailure => {
                    return Err(EngineError::UnrelatedHistories { proposal: id });
                }
            };

            // Already applied upstream.
            if tree == get_tree_sha(ws.path(), tip.as_str()).in_proposal(id)? {
                tracing::debug!(proposal = %id, commit = %commit, "skipping empty replay");
                continue;
            }

            let original = commit_summary(ws.path(), commit.as_str()).in_proposal(id)?;
            tip = commit_tree(
                ws.path(),
                &tree,
                &[&tip],
                &original.message,
                &original.author,
                committer,
            )
            .in_proposal(id)?;
        }
        Ok(tip)
    }

    fn default_message(
        &self,
        ws: &Workspace,
        proposal: &Proposal,
        style: MergeStyle,
    ) -> EngineResult<String> {
        let head_label = if proposal.is_same_repo() {
            proposal.head.branch.clone()
        } else {
            proposal.head.to_string()
        };

        Ok(match style {
            MergeStyle::Merge | MergeStyle::RebaseMerge => format!(
                "Merge pull request '{}' (#{}) from {} into {}",
                proposal.title, proposal.index, head_label, proposal.base.branch
            ),
            MergeStyle::Squash => {
                let title = format!("{} (#{})", proposal.title, proposal.index);
                let body = self.squash_body(ws, proposal)?;
                if body.is_empty() {
                    title
                } else {
                    format!("{}\n\n{}", title, body)
                }
            }
            MergeStyle::Rebase | MergeStyle::FastForwardOnly => String::new(),
        })
    }

    /// The body of a squash commit for an open proposal.
    pub fn squash_message(&self, id: ProposalId) -> EngineResult<String> {
        let proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        let ws = self.workspace(&proposal)?;
        self.squash_body(&ws, &proposal)
    }

    fn squash_body(&self, ws: &Workspace, proposal: &Proposal) -> EngineResult<String> {
        let id = proposal.id;
        let Some(base) = merge_base(ws.path(), BASE, TRACKING).in_proposal(id)? else {
            return Err(EngineError::UnrelatedHistories { proposal: id });
        };
        let commits = commits_between(ws.path(), base.as_str(), TRACKING).in_proposal(id)?;

        let mut accounts = HashMap::new();
        for commit in &commits {
            if !accounts.contains_key(&commit.author.email) {
                let account = self
                    .services
                    .accounts
                    .account_by_email(&commit.author.email)?;
                accounts.insert(commit.author.email.clone(), account);
            }
        }

        let input = SquashInput {
            title: &proposal.title,
            description: &proposal.description,
            poster: &proposal.poster,
            commits: &commits,
        };
        Ok(compose_squash_message(&input, &self.config.squash, |email| {
            accounts.get(email).copied().flatten()
        }))
    }

    /// Branch deletion and its cascades. Failures are logged: the merge
    /// itself already succeeded.
    fn after_merge(&self, merged: &Proposal, actor: &Actor, request: &MergeRequest) {
        if request.delete_branch {
            match self.delete_head_branch(merged, actor) {
                Ok(true) => {
                    if let Err(e) = self.retarget_children_on_merge(actor, merged) {
                        tracing::warn!(
                            proposal = %merged.id,
                            error = %e,
                            "retargeting children failed"
                        );
                    }
                    if let Err(e) =
                        self.close_head_pulls(actor, &merged.head.repo, &merged.head.branch)
                    {
                        tracing::warn!(
                            proposal = %merged.id,
                            error = %e,
                            "closing branch proposals failed"
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(proposal = %merged.id, error = %e, "head branch not deleted");
                }
            }
        }

        // Proposals into the same base are now behind it.
        if let Err(e) = self.on_branch_pushed(actor, &merged.base.repo, &merged.base.branch) {
            tracing::warn!(
                proposal = %merged.id,
                error = %e,
                "refreshing sibling proposals failed"
            );
        }
    }

    /// Deletes the head branch of a merged same-repository proposal.
    ///
    /// Returns `false` when the branch is kept: cross-repository heads,
    /// protected branches, and branches that moved past the merged head.
    fn delete_head_branch(&self, merged: &Proposal, actor: &Actor) -> EngineResult<bool> {
        let id = merged.id;
        let repo = &merged.head.repo;
        let branch = &merged.head.branch;
        if !merged.is_same_repo() || merged.flow != Flow::Fork {
            tracing::debug!(proposal = %id, "head is not a local branch, keeping it");
            return Ok(false);
        }

        if !self.services.permissions.access_mode(repo, actor.id)?.can_write() {
            return Err(EngineError::Forbidden {
                actor: actor.id,
                action: "delete the head branch",
            });
        }
        if self
            .services
            .protection
            .first_matching_rule(repo, branch)?
            .is_some()
        {
            tracing::info!(proposal = %id, %branch, "head branch is protected, keeping it");
            return Ok(false);
        }

        let repo_path = self.git().repo_path(repo);
        let tip = resolve_ref(&repo_path, &format!("refs/heads/{}", branch)).in_proposal(id)?;
        let Some(tip) = tip.filter(|tip| Some(tip) == merged.head_commit.as_ref()) else {
            tracing::info!(proposal = %id, %branch, "head branch moved after merge, keeping it");
            return Ok(false);
        };

        delete_branch(&repo_path, branch, &tip).in_proposal(id)?;
        let mut changes = Changeset::new();
        changes.record(HistoryEntry::now(
            id,
            actor.id,
            HistoryEvent::DeletedBranch {
                branch: branch.clone(),
            },
        ));
        self.store.commit(changes)?;

        tracing::info!(proposal = %id, %repo, %branch, "deleted head branch");
        Ok(true)
    }

    /// Arranges for the proposal to be merged once checks on its current
    /// head succeed. Merges immediately if they already have.
    ///
    /// Returns the merged commit when the merge happened right away.
    #[instrument(skip(self, actor, request), fields(proposal = %id, actor = %actor.id))]
    pub fn schedule_auto_merge(
        &self,
        id: ProposalId,
        actor: &Actor,
        request: &MergeRequest,
    ) -> EngineResult<Option<Sha>> {
        let (repo, head) = {
            let _guard = self.coordinator.acquire(id);
            let mut proposal = self.proposal(id)?;
            ensure_open(&proposal)?;
            if !is_allowed_to_merge(&self.services, &proposal, actor.id)? {
                return Err(EngineError::Forbidden {
                    actor: actor.id,
                    action: "merge",
                });
            }

            proposal.auto_merge = Some(AutoMerge {
                actor: actor.clone(),
                style: request.style,
                message: request.message.clone(),
                delete_branch: request.delete_branch,
            });
            let target = (proposal.base.repo.clone(), proposal.head_commit.clone());

            let mut changes = Changeset::new();
            changes.update(proposal).record(HistoryEntry::now(
                id,
                actor.id,
                HistoryEvent::AutoMergeScheduled {
                    style: request.style,
                },
            ));
            self.store.commit(changes)?;
            target
        };

        let Some(head) = head else {
            return Ok(None);
        };
        if !self.services.statuses.combined_state(&repo, &head)?.is_success() {
            return Ok(None);
        }
        self.run_auto_merge(id)
    }

    /// Reacts to the combined status of `commit` changing in `repo`.
    ///
    /// Merges every proposal with a pending auto-merge on that head once the
    /// checks succeeded. Proposals that cannot merge yet keep their schedule.
    #[instrument(skip(self))]
    pub fn on_checks_completed(&self, repo: &RepoId, commit: &Sha) -> EngineResult<Vec<Sha>> {
        let state = self.services.statuses.combined_state(repo, commit)?;
        if !state.is_success() {
            tracing::debug!(%state, "checks not successful, nothing to merge");
            return Ok(Vec::new());
        }

        let candidates = self.store.find(&Query::AutoMergeOnCommit {
            repo: repo.clone(),
            commit: commit.clone(),
        })?;

        let mut merged = Vec::new();
        for proposal in candidates {
            match self.run_auto_merge(proposal.id) {
                Ok(Some(commit)) => merged.push(commit),
                Ok(None) => {}
                Err(e) if e.is_already_in_state() => {}
                Err(e) => {
                    tracing::warn!(
                        proposal = %proposal.id,
                        error = %e,
                        "auto-merge did not happen"
                    );
                }
            }
        }
        Ok(merged)
    }

    fn run_auto_merge(&self, id: ProposalId) -> EngineResult<Option<Sha>> {
        let proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        let Some(auto) = proposal.auto_merge.clone() else {
            return Ok(None);
        };
        if proposal.status == Status::Checking {
            self.test_mergeable(id)?;
        }

        let request = MergeRequest {
            style: auto.style,
            message: auto.message,
            delete_branch: auto.delete_branch,
            force: false,
            expected_head: proposal.head_commit,
        };
        self.merge(id, &auto.actor, &request).map(Some)
    }
}
