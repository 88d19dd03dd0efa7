//! Bringing heads up to date and applying single commits to branches.

use tracing::instrument;

use crate::error::{EngineError, EngineResult};
use crate::git::commit_tree;
use crate::git::divergence::{divergence, merge_base};
use crate::git::propagate::{propagate_head, push_commit};
use crate::git::refs::commit_summary;
use crate::git::resolve::{self, MergeOutcome};
use crate::git::workspace::{BASE, TRACKING, Workspace};
use crate::persistence::Changeset;
use crate::policy::is_allowed_to_update;
use crate::types::{Actor, Flow, ProposalId, Sha};

use super::{CherryPickRequest, Engine, InProposal, ensure_open};

impl Engine {
    /// Updates the head branch with its base and returns the new head.
    ///
    /// By default the base is merged into the head and pushed as a
    /// fast-forward. With `rebase` the head commits are replayed onto the
    /// base and force-pushed, provided the head did not move meanwhile.
    #[instrument(skip(self, actor), fields(proposal = %id, actor = %actor.id))]
    pub fn update(&self, id: ProposalId, actor: &Actor, rebase: bool) -> EngineResult<Sha> {
        let _guard = self.coordinator.acquire(id);
        let mut proposal = self.proposal(id)?;
        ensure_open(&proposal)?;
        if proposal.flow == Flow::DirectRef {
            return Err(EngineError::UnsupportedFlow { proposal: id });
        }

        let allowed = is_allowed_to_update(&self.services, &proposal, actor.id)?;
        if (rebase && !allowed.rebase) || (!rebase && !allowed.merge) {
            return Err(EngineError::Forbidden {
                actor: actor.id,
                action: if rebase {
                    "rebase the head branch"
                } else {
                    "update the head branch"
                },
            });
        }

        let ws = self.workspace(&proposal)?;
        if divergence(&ws).in_proposal(id)?.behind == 0 {
            return Err(EngineError::UpToDate { proposal: id });
        }
        if merge_base(ws.path(), BASE, TRACKING).in_proposal(id)?.is_none() {
            return Err(EngineError::UnrelatedHistories { proposal: id });
        }

        let head = ws.rev(TRACKING).in_proposal(id)?;
        let base = ws.rev(BASE).in_proposal(id)?;
        let committer = self.committer(actor);
        let new_head = if rebase {
            self.replay(&ws, id, &base, TRACKING, &committer)?
        } else {
            let tree = self.merged_tree(&ws, id, TRACKING, BASE)?;
            let message = format!(
                "Merge branch '{}' into {}",
                proposal.base.branch, proposal.head.branch
            );
            commit_tree(
                ws.path(),
                &tree,
                &[&head, &base],
                &message,
                &actor.signature(),
                &committer,
            )
            .in_proposal(id)?
        };

        let head_path = self.git().repo_path(&proposal.head.repo);
        let lease = rebase.then_some(&head);
        push_commit(ws.path(), &head_path, &new_head, &proposal.head.branch, lease)
            .map_err(|e| EngineError::propagate(id, e))?;
        propagate_head(self.git(), &proposal, None).map_err(|e| EngineError::propagate(id, e))?;

        let old_head = proposal.head_commit.clone();
        ws.set_ref(TRACKING, &new_head).in_proposal(id)?;
        self.evaluate(&ws, &mut proposal)?;

        let mut changes = Changeset::new();
        if let Some(entry) = self.pushed_commits(&ws, &proposal, actor.id, old_head.as_ref())? {
            changes.record(entry);
        }
        changes.update(proposal);
        self.store.commit(changes)?;

        tracing::info!(proposal = %id, head = %new_head, rebase, "updated head from base");
        Ok(new_head)
    }

    /// Applies (or reverts) a single commit on top of a branch and returns
    /// the new branch tip. The commit must exist in the branch's repository.
    #[instrument(
        skip(self, actor, request),
        fields(
            actor = %actor.id,
            repo = %request.repo,
            branch = %request.branch,
            commit = %request.commit
        )
    )]
    pub fn cherry_pick(&self, actor: &Actor, request: &CherryPickRequest) -> EngineResult<Sha> {
        let repo = &request.repo;
        let branch = &request.branch;

        let mode = self.services.permissions.access_mode(repo, actor.id)?;
        let allowed = match self.services.protection.first_matching_rule(repo, branch)? {
            Some(rule) => rule.can_user_push(actor.id, mode),
            None => mode.can_write(),
        };
        if !allowed {
            return Err(EngineError::Forbidden {
                actor: actor.id,
                action: "push to this branch",
            });
        }

        let repo_path = self.git().repo_path(repo);
        let ws = Workspace::for_branch(self.git(), "cherry-pick", repo, branch)?;
        let tip = ws.rev(BASE)?;
        if let Some(expected) = &request.expected_tip
            && *expected != tip
        {
            return Err(EngineError::StaleBranch {
                branch: branch.clone(),
                expected: expected.to_string(),
                actual: tip.to_string(),
            });
        }
        ws.borrow_objects(&repo_path)?;

        let commit = request.commit.as_str();
        let original = commit_summary(ws.path(), commit)?;
        let outcome = if request.revert {
            resolve::revert(ws.path(), self.strategy, tip.as_str(), commit)?
        } else {
            resolve::cherry_pick(ws.path(), self.strategy, tip.as_str(), commit)?
        };
        let tree = match outcome {
            MergeOutcome::Clean { tree } => tree,
            MergeOutcome::Conflict { paths } => {
                return Err(EngineError::CherryPickConflict {
                    commit: request.commit.clone(),
                    paths,
                });
            }
            MergeOutcome::StructuralFailure => {
                return Err(EngineError::CherryPickConflict {
                    commit: request.commit.clone(),
                    paths: Vec::new(),
                });
            }
        };

        let (author, default_message) = if request.revert {
            let subject = original.message.lines().next().unwrap_or_default();
            (
                actor.signature(),
                format!(
                    "Revert \"{}\"\n\nThis reverts commit {}.",
                    subject, request.commit
                ),
            )
        } else {
            (original.author, original.message)
        };
        let message = request.message.clone().unwrap_or(default_message);

        let new_tip = commit_tree(
            ws.path(),
            &tree,
            &[&tip],
            &message,
            &author,
            &self.committer(actor),
        )?;
        push_commit(ws.path(), &repo_path, &new_tip, branch, None)
            .map_err(|e| EngineError::push_branch(repo, branch, e))?;

        tracing::info!(tip = %new_tip, revert = request.revert, "applied commit to branch");
        if let Err(e) = self.on_branch_pushed(actor, repo, branch) {
            tracing::warn!(error = %e, "refreshing proposals after cherry-pick failed");
        }
        Ok(new_tip)
    }
}
