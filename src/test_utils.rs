//! Shared test utilities: arbitrary generators and real git repository fixtures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::git::resolve::ResolverStrategy;
use crate::git::{
    GitConfig, commit_tree, git_command, resolve_ref, run_git_stdout, run_git_sync,
};
use crate::persistence::{MemoryStore, ProposalStore};
use crate::policy::{AccessMode, Services, StaticPolicy};
use crate::pull::{Engine, NewProposal};
use crate::types::{
    Actor, Divergence, Endpoint, Flow, Proposal, ProposalId, RepoId, Sha, Signature, Status,
    UserId,
};

pub fn arb_sha() -> impl Strategy<Value = Sha> {
    "[0-9a-f]{40}".prop_map(|s| Sha::parse(s).unwrap())
}

pub fn arb_datetime() -> impl Strategy<Value = DateTime<Utc>> {
    (946684800i64..4102444800i64).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap())
}

pub fn arb_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Checking),
        Just(Status::Mergeable),
        Just(Status::Conflict),
        Just(Status::Closed),
        (arb_sha(), any::<u64>(), arb_datetime()).prop_map(|(commit, user, at)| {
            Status::Merged {
                commit,
                merged_by: UserId(user),
                merged_at: at,
            }
        }),
    ]
}

/// The account that opens proposals in fixtures.
pub fn poster() -> Actor {
    Actor::new(1, "Poster", "poster@example.com")
}

/// A maintainer with write access in the default fixture policy.
pub fn maintainer() -> Actor {
    Actor::new(2, "Maintainer", "maintainer@example.com")
}

/// An open same-repository proposal in `acme/upstream`.
pub fn sample_proposal(id: u64, head_branch: &str, base_branch: &str) -> Proposal {
    let repo = TestRepos::repo_id("upstream");
    Proposal {
        id: ProposalId(id),
        index: id,
        title: format!("Proposal {}", id),
        description: String::new(),
        poster: poster(),
        head: Endpoint::new(repo.clone(), head_branch),
        base: Endpoint::new(repo, base_branch),
        flow: Flow::Fork,
        status: Status::Checking,
        divergence: Divergence::default(),
        merge_base: None,
        head_commit: None,
        allow_maintainer_edit: false,
        conflicted_files: Vec::new(),
        changed_protected_files: Vec::new(),
        auto_merge: None,
        created_at: Utc::now(),
        version: 0,
    }
}

/// A set of bare repositories under one temporary directory.
///
/// Repositories are addressed by short name and live at the path
/// `GitConfig::repo_path` computes for `acme/<name>`.
pub struct TestRepos {
    dir: TempDir,
    pub config: GitConfig,
}

impl TestRepos {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = GitConfig {
            repos_root: dir.path().join("repos"),
            workspace_root: dir.path().join("workspaces"),
            ref_prefix: "pull".to_string(),
            workspace_max_age: Duration::from_secs(24 * 3600),
        };
        TestRepos { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo_id(name: &str) -> RepoId {
        RepoId::new("acme", name)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.config.repo_path(&Self::repo_id(name))
    }

    /// Initializes the bare repository if it does not exist yet.
    pub fn init(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        if !path.exists() {
            std::fs::create_dir_all(&path).unwrap();
            run_git_sync(&path, &["init", "--bare", "--quiet"]).unwrap();
            run_git_sync(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]).unwrap();
        }
        path
    }

    pub fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        file: &str,
        content: &str,
        message: &str,
    ) -> Sha {
        self.commit_file_as(repo, branch, file, content, message, &poster().signature())
    }

    /// Commits `file` with `content` on top of `branch` (creating it if needed).
    pub fn commit_file_as(
        &self,
        repo: &str,
        branch: &str,
        file: &str,
        content: &str,
        message: &str,
        author: &Signature,
    ) -> Sha {
        self.commit_entry(repo, branch, file, content, "100644", message, author)
    }

    /// Like [`commit_file`](Self::commit_file) with the executable bit set.
    pub fn commit_executable(
        &self,
        repo: &str,
        branch: &str,
        file: &str,
        content: &str,
        message: &str,
    ) -> Sha {
        let author = poster().signature();
        self.commit_entry(repo, branch, file, content, "100755", message, &author)
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_entry(
        &self,
        repo: &str,
        branch: &str,
        file: &str,
        content: &str,
        mode: &str,
        message: &str,
        author: &Signature,
    ) -> Sha {
        let path = self.init(repo);

        let scratch = self.dir.path().join("scratch");
        std::fs::write(&scratch, content).unwrap();
        let blob = run_git_stdout(&path, &["hash-object", "-w", scratch.to_str().unwrap()])
            .unwrap();

        let index = self.dir.path().join("scratch-index");
        let _ = std::fs::remove_file(&index);

        let parent = resolve_ref(&path, &format!("refs/heads/{}", branch)).unwrap();
        if let Some(parent) = &parent {
            git_with_index(&path, &index, &["read-tree", parent.as_str()]);
        }
        git_with_index(
            &path,
            &index,
            &[
                "update-index",
                "--add",
                "--cacheinfo",
                &format!("{},{},{}", mode, blob, file),
            ],
        );
        let tree = Sha::parse(git_with_index(&path, &index, &["write-tree"])).unwrap();

        let parents: Vec<&Sha> = parent.iter().collect();
        let commit = commit_tree(&path, &tree, &parents, message, author, author).unwrap();
        self.set_branch(repo, branch, &commit);
        commit
    }

    pub fn set_branch(&self, repo: &str, branch: &str, commit: &Sha) {
        run_git_sync(
            &self.path(repo),
            &[
                "update-ref",
                &format!("refs/heads/{}", branch),
                commit.as_str(),
            ],
        )
        .unwrap();
    }

    /// Creates a bare fork `to` holding every branch of `from`.
    pub fn fork(&self, from: &str, to: &str) {
        let to_path = self.path(to);
        std::fs::create_dir_all(to_path.parent().unwrap()).unwrap();
        run_git_sync(
            self.dir.path(),
            &[
                "clone",
                "--bare",
                "--quiet",
                self.path(from).to_str().unwrap(),
                to_path.to_str().unwrap(),
            ],
        )
        .unwrap();
    }

    pub fn tip(&self, repo: &str, branch: &str) -> Sha {
        self.resolve(repo, &format!("refs/heads/{}", branch))
            .unwrap()
    }

    pub fn resolve(&self, repo: &str, refname: &str) -> Option<Sha> {
        resolve_ref(&self.path(repo), refname).unwrap()
    }

    /// Reads a file at `rev`, or `None` when the path does not exist there.
    pub fn read_file(&self, repo: &str, rev: &str, file: &str) -> Option<String> {
        let output = git_command(&self.path(repo))
            .args(["show", &format!("{}:{}", rev, file)])
            .output()
            .unwrap();
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn git_with_index(repo: &Path, index: &Path, args: &[&str]) -> String {
    let output = git_command(repo)
        .env("GIT_INDEX_FILE", index)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// The default fixture policy: the poster owns `acme/fork`, the maintainer
/// writes to both repositories.
pub fn fixture_policy() -> StaticPolicy {
    let upstream = TestRepos::repo_id("upstream");
    let fork = TestRepos::repo_id("fork");
    StaticPolicy::new()
        .with_grant(&upstream, maintainer().id, AccessMode::Write)
        .with_grant(&fork, maintainer().id, AccessMode::Write)
        .with_grant(&fork, poster().id, AccessMode::Owner)
}

/// An engine over fresh repositories, an in-memory store and a
/// [`StaticPolicy`] the test can keep adjusting.
pub struct TestEngine {
    pub repos: TestRepos,
    pub policy: Arc<StaticPolicy>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<Engine>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(fixture_policy(), |_| {})
    }

    pub fn with_policy(policy: StaticPolicy) -> Self {
        Self::with_config(policy, |_| {})
    }

    pub fn with_config(policy: StaticPolicy, adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build(policy, adjust, |store| store as Arc<dyn ProposalStore>)
    }

    /// An engine whose store is `wrap` applied to the in-memory store, which
    /// stays reachable as [`TestEngine::store`].
    pub fn with_store(
        policy: StaticPolicy,
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn ProposalStore>,
    ) -> Self {
        Self::build(policy, |_| {}, wrap)
    }

    fn build(
        policy: StaticPolicy,
        adjust: impl FnOnce(&mut EngineConfig),
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn ProposalStore>,
    ) -> Self {
        let repos = TestRepos::new();
        let mut config = EngineConfig::new(repos.root());
        config.git = repos.config.clone();
        config.resolver = Some(ResolverStrategy::IndexMerge);
        adjust(&mut config);

        let policy = Arc::new(policy);
        let store = Arc::new(MemoryStore::new());
        let services = Services::uniform(policy.clone());
        let engine = Arc::new(Engine::new(config, wrap(store.clone()), services).unwrap());
        TestEngine {
            repos,
            policy,
            store,
            engine,
        }
    }

    /// Opens a fork-flow proposal by the fixture poster.
    pub fn open(&self, head_repo: &str, head_branch: &str, base_branch: &str) -> Proposal {
        self.engine
            .open_proposal(self.new_proposal(head_repo, head_branch, base_branch))
            .unwrap()
    }

    pub fn new_proposal(
        &self,
        head_repo: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> NewProposal {
        NewProposal {
            title: format!("Land {}", head_branch),
            description: String::new(),
            poster: poster(),
            head: Endpoint::new(TestRepos::repo_id(head_repo), head_branch),
            base: Endpoint::new(TestRepos::repo_id("upstream"), base_branch),
            allow_maintainer_edit: false,
            head_commit: None,
        }
    }

    pub fn load(&self, id: ProposalId) -> Proposal {
        self.engine.proposal(id).unwrap()
    }
}
