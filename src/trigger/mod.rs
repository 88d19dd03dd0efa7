//! Events that drive the engine.
//!
//! A [`Trigger`] names one engine entry point and its arguments. Triggers
//! arrive from whatever observes the repositories (push hooks, check
//! reporters, a user interface) and are run by the [`Dispatcher`].
//!
//! Handling is synchronous: the engine shells out to git and blocks. The
//! dispatcher runs each trigger on the blocking pool, so triggers for
//! different proposals proceed concurrently while the engine's coordinator
//! serializes work on any single proposal.

mod dispatch;

pub use dispatch::{DEFAULT_CHANNEL_CAPACITY, Dispatcher};

use crate::error::EngineResult;
use crate::pull::{Engine, MergeRequest};
use crate::types::{Actor, ProposalId, RepoId, Sha};

/// Something that happened, or was asked for, that the engine reacts to.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A branch moved in a repository.
    BranchPushed {
        actor: Actor,
        repo: RepoId,
        branch: String,
    },

    /// A direct-ref proposal was given a new head commit.
    DirectRefPushed {
        proposal: ProposalId,
        actor: Actor,
        commit: Sha,
    },

    /// A branch was deleted without a merge.
    BranchDeleted {
        actor: Actor,
        repo: RepoId,
        branch: String,
    },

    /// Re-test a proposal's mergeability.
    Test { proposal: ProposalId },

    /// Update a proposal's head from its base.
    Update {
        proposal: ProposalId,
        actor: Actor,
        rebase: bool,
    },

    Merge {
        proposal: ProposalId,
        actor: Actor,
        request: MergeRequest,
    },

    /// The combined check state of a commit changed.
    ChecksCompleted { repo: RepoId, commit: Sha },

    /// Periodic refresh of every open proposal.
    Sweep,
}

impl Trigger {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::BranchPushed { .. } => "branch_pushed",
            Trigger::DirectRefPushed { .. } => "direct_ref_pushed",
            Trigger::BranchDeleted { .. } => "branch_deleted",
            Trigger::Test { .. } => "test",
            Trigger::Update { .. } => "update",
            Trigger::Merge { .. } => "merge",
            Trigger::ChecksCompleted { .. } => "checks_completed",
            Trigger::Sweep => "sweep",
        }
    }
}

/// Runs a trigger to completion on the calling thread.
pub fn handle(engine: &Engine, trigger: Trigger) -> EngineResult<()> {
    match trigger {
        Trigger::BranchPushed {
            actor,
            repo,
            branch,
        } => engine.on_branch_pushed(&actor, &repo, &branch),
        Trigger::DirectRefPushed {
            proposal,
            actor,
            commit,
        } => engine.push_direct_ref(proposal, &actor, &commit),
        Trigger::BranchDeleted {
            actor,
            repo,
            branch,
        } => engine.close_branch_pulls(&actor, &repo, &branch),
        Trigger::Test { proposal } => engine.test_mergeable(proposal).map(|_| ()),
        Trigger::Update {
            proposal,
            actor,
            rebase,
        } => engine.update(proposal, &actor, rebase).map(|_| ()),
        Trigger::Merge {
            proposal,
            actor,
            request,
        } => engine.merge(proposal, &actor, &request).map(|_| ()),
        Trigger::ChecksCompleted { repo, commit } => {
            engine.on_checks_completed(&repo, &commit).map(|_| ())
        }
        Trigger::Sweep => engine.sweep().map(|_| ()),
    }
}
