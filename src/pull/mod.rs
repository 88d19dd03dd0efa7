//! The pull-request integration engine.
//!
//! [`Engine`] drives every operation on a proposal: lock it, build a
//! workspace, compute divergence and test merges, propagate refs, then
//! commit the staged state change.
//!
//! - [`coordinator`]: per-proposal mutual exclusion
//! - [`evaluate`]: divergence, mergeability, opening and push synchronization
//! - [`merge`]: merge styles, squash messages and auto-merge
//! - [`update`]: updating a head from its base, cherry-picks and reverts
//! - [`cascade`]: target branch changes, retargeting and closing

pub mod cascade;
pub mod coordinator;
pub mod evaluate;
pub mod merge;
pub mod update;


use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::git::resolve::ResolverStrategy;
use crate::git::workspace::Workspace;
use crate::git::{GitConfig, GitError, GitResult};
use crate::persistence::{ProposalStore, StoreError};
use crate::policy::Services;
use crate::types::{Actor, Endpoint, MergeStyle, Proposal, ProposalId, RepoId, Sha, Signature};

pub use coordinator::{Coordinator, ProposalGuard};

/// How to merge a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub style: MergeStyle,

    /// Commit message; empty for the style's default.
    pub message: String,

    /// Delete the head branch afterwards (same-repository proposals only).
    pub delete_branch: bool,

    /// Let an admin merge past protection the matching rule exempts them from.
    pub force: bool,

    /// Refuse to merge if the head is no longer at this commit.
    pub expected_head: Option<Sha>,
}

impl MergeRequest {
    pub fn new(style: MergeStyle) -> Self {
        MergeRequest {
            style,
            message: String::new(),
            delete_branch: false,
            force: false,
            expected_head: None,
        }
    }
}

/// A proposal to be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProposal {
    pub title: String,
    pub description: String,
    pub poster: Actor,
    pub head: Endpoint,
    pub base: Endpoint,
    pub allow_maintainer_edit: bool,

    /// Opens a direct-ref proposal whose internal ref starts at this commit
    /// (which must exist in the base repository). `None` opens a fork-flow
    /// proposal from the head branch.
    pub head_commit: Option<Sha>,
}

/// A commit to apply to (or revert from) a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CherryPickRequest {
    pub repo: RepoId,
    pub branch: String,
    pub commit: Sha,
    pub revert: bool,

    /// Refuse if the branch moved away from this commit.
    pub expected_tip: Option<Sha>,

    /// Commit message; defaults to the original (or a revert) message.
    pub message: Option<String>,
}

/// The integration engine.
///
/// All methods block on git subprocesses. Methods mutating a proposal hold
/// its coordinator slot for their whole duration.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ProposalStore>,
    services: Services,
    coordinator: Coordinator,
    strategy: ResolverStrategy,
}

impl Engine {
    /// Creates an engine, detecting the resolver strategy unless configured.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ProposalStore>,
        services: Services,
    ) -> EngineResult<Self> {
        std::fs::create_dir_all(&config.git.workspace_root).map_err(GitError::Io)?;
        let strategy = match config.resolver {
            Some(strategy) => strategy,
            None => ResolverStrategy::detect(&config.git.workspace_root)?,
        };

        tracing::info!(
            resolver = %strategy,
            repos_root = %config.git.repos_root.display(),
            workspace_root = %config.git.workspace_root.display(),
            "integration engine ready"
        );

        Ok(Engine {
            config,
            store,
            services,
            coordinator: Coordinator::new(),
            strategy,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProposalStore> {
        &self.store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn strategy(&self) -> ResolverStrategy {
        self.strategy
    }

    /// Loads a proposal.
    pub fn proposal(&self, id: ProposalId) -> EngineResult<Proposal> {
        self.store.load(id).map_err(|e| match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            e => e.into(),
        })
    }

    fn git(&self) -> &GitConfig {
        &self.config.git
    }

    fn committer(&self, actor: &Actor) -> Signature {
        self.config
            .committer
            .clone()
            .unwrap_or_else(|| actor.signature())
    }

    fn workspace(&self, proposal: &Proposal) -> EngineResult<Workspace> {
        Workspace::for_proposal(self.git(), proposal).in_proposal(proposal.id)
    }

    /// Refuses to proceed unless `actor` may edit the proposal: its poster
    /// or a writer on the base repository, and not blocked.
    fn ensure_can_edit(
        &self,
        proposal: &Proposal,
        actor: &Actor,
        action: &'static str,
    ) -> EngineResult<()> {
        if self
            .services
            .accounts
            .is_blocked(&proposal.base.repo, proposal.poster.id, actor.id)?
        {
            return Err(EngineError::Blocked { actor: actor.id });
        }
        if actor.id == proposal.poster.id {
            return Ok(());
        }
        let mode = self
            .services
            .permissions
            .access_mode(&proposal.base.repo, actor.id)?;
        if !mode.can_write() {
            return Err(EngineError::Forbidden {
                actor: actor.id,
                action,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("strategy", &self.strategy)
            .field("git", &self.config.git)
            .finish_non_exhaustive()
    }
}

/// Merged and closed proposals short-circuit here.
fn ensure_open(proposal: &Proposal) -> EngineResult<()> {
    if proposal.status.is_merged() {
        return Err(EngineError::AlreadyMerged {
            proposal: proposal.id,
        });
    }
    if proposal.status.is_closed() {
        return Err(EngineError::IssueClosed {
            proposal: proposal.id,
        });
    }
    Ok(())
}

/// Folds independent failures into one error.
fn collect_errors(mut errors: Vec<EngineError>) -> EngineResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(EngineError::Multiple(errors)),
    }
}

/// Attaches the proposal id to git failures.
trait InProposal<T> {
    fn in_proposal(self, id: ProposalId) -> EngineResult<T>;
}

impl<T> InProposal<T> for GitResult<T> {
    fn in_proposal(self, id: ProposalId) -> EngineResult<T> {
        self.map_err(|e| EngineError::git(id, e))
    }
}
