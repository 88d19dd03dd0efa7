//! Temporary merge workspaces.
//!
//! A workspace is a throwaway repository allocated under the configured
//! workspace root. It holds the proposal's endpoints as local branches:
//!
//! - `base` and `original_base`: the tip of the base branch
//! - `tracking`: the tip of the head (branch or internal ref)
//!
//! Merges are computed here and never touch a hosted repository. The
//! directory is removed when the handle is dropped, on every exit path
//! including unwinding.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::types::{Flow, Proposal, RepoId, Sha};

use super::{GitConfig, GitError, GitResult, branch_exists, resolve_ref, rev_parse, run_git_sync};

/// Local branch holding the base tip. Merges move it.
pub const BASE: &str = "refs/heads/base";

/// Local branch holding the base tip as fetched. Never moved.
pub const ORIGINAL_BASE: &str = "refs/heads/original_base";

/// Local branch holding the head tip.
pub const TRACKING: &str = "refs/heads/tracking";

const PREFIX: &str = "pr-";

/// An exclusively owned temporary repository.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Allocates an empty workspace named after `label`.
    pub fn allocate(config: &GitConfig, label: &str) -> GitResult<Workspace> {
        std::fs::create_dir_all(&config.workspace_root).map_err(|e| GitError::Workspace {
            details: format!(
                "cannot create workspace root {}: {}",
                config.workspace_root.display(),
                e
            ),
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}-", PREFIX, label))
            .tempdir_in(&config.workspace_root)
            .map_err(|e| GitError::Workspace {
                details: format!("cannot allocate workspace for {}: {}", label, e),
            })?;

        run_git_sync(dir.path(), &["init", "--bare", "--quiet"])?;

        tracing::debug!(path = %dir.path().display(), "allocated workspace");
        Ok(Workspace { dir })
    }

    /// Creates a workspace holding the proposal's base and head tips.
    ///
    /// Fails with [`GitError::BranchNotFound`] when the base branch, the head
    /// branch (fork flow) or the internal ref (direct-ref flow) is missing.
    pub fn for_proposal(config: &GitConfig, proposal: &Proposal) -> GitResult<Workspace> {
        let ws = Workspace::allocate(config, &proposal.id.0.to_string())?;

        let base_path = config.repo_path(&proposal.base.repo);
        ws.fetch_branch(
            &base_path,
            &proposal.base.repo,
            &proposal.base.branch,
            &[BASE, ORIGINAL_BASE],
        )?;

        match proposal.flow {
            Flow::Fork => {
                let head_path = config.repo_path(&proposal.head.repo);
                ws.fetch_branch(
                    &head_path,
                    &proposal.head.repo,
                    &proposal.head.branch,
                    &[TRACKING],
                )?;
            }
            Flow::DirectRef => {
                let internal = proposal.internal_ref(&config.ref_prefix);
                ws.fetch_ref(&base_path, &proposal.base.repo, &internal, &[TRACKING])?;
            }
        }

        Ok(ws)
    }

    /// Creates a workspace holding a single branch as `base`.
    pub fn for_branch(
        config: &GitConfig,
        label: &str,
        repo: &RepoId,
        branch: &str,
    ) -> GitResult<Workspace> {
        let ws = Workspace::allocate(config, label)?;
        ws.fetch_branch(&config.repo_path(repo), repo, branch, &[BASE, ORIGINAL_BASE])?;
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Fetches `refs/heads/<branch>` from `source` into each local ref.
    pub fn fetch_branch(
        &self,
        source: &Path,
        repo: &RepoId,
        branch: &str,
        local: &[&str],
    ) -> GitResult<()> {
        if !source.exists() || !branch_exists(source, branch)? {
            return Err(GitError::BranchNotFound {
                repo: repo.clone(),
                branch: branch.to_string(),
            });
        }
        self.fetch(source, &format!("refs/heads/{}", branch), local)
    }

    /// Fetches an arbitrary ref from `source` into each local ref.
    pub fn fetch_ref(
        &self,
        source: &Path,
        repo: &RepoId,
        refname: &str,
        local: &[&str],
    ) -> GitResult<()> {
        if !source.exists() || resolve_ref(source, refname)?.is_none() {
            return Err(GitError::BranchNotFound {
                repo: repo.clone(),
                branch: refname.to_string(),
            });
        }
        self.fetch(source, refname, local)
    }

    fn fetch(&self, source: &Path, refname: &str, local: &[&str]) -> GitResult<()> {
        let source = source.to_string_lossy();
        let refspecs: Vec<String> = local
            .iter()
            .map(|dst| format!("+{}:{}", refname, dst))
            .collect();

        let mut args = vec!["fetch", "--quiet", "--no-tags", source.as_ref()];
        args.extend(refspecs.iter().map(String::as_str));
        run_git_sync(self.path(), &args)?;
        Ok(())
    }

    /// Makes every object of `source` readable here without fetching.
    ///
    /// Used when an operation names a commit by id rather than by ref.
    pub fn borrow_objects(&self, source: &Path) -> GitResult<()> {
        use std::io::Write;

        // Alternates are resolved relative to the objects directory.
        let objects = source.canonicalize()?.join("objects");
        let alternates = self.path().join("objects").join("info").join("alternates");
        if let Some(parent) = alternates.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&alternates)?;
        writeln!(file, "{}", objects.display())?;
        Ok(())
    }

    /// Resolves a ref or revision inside the workspace.
    pub fn rev(&self, rev: &str) -> GitResult<Sha> {
        rev_parse(self.path(), rev)
    }

    /// Points a local ref at `commit`.
    pub fn set_ref(&self, refname: &str, commit: &Sha) -> GitResult<()> {
        run_git_sync(self.path(), &["update-ref", refname, commit.as_str()])?;
        Ok(())
    }

    /// Removes the workspace, reporting removal errors.
    ///
    /// Dropping the handle also removes it but ignores errors.
    pub fn close(self) -> GitResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| GitError::Workspace {
            details: format!("cannot remove workspace {}: {}", path.display(), e),
        })
    }
}

/// Removes workspaces left behind by a previous process.
///
/// A crash (or SIGKILL) skips drop handlers, so allocation directories may
/// survive. Anything under the workspace root with our prefix that is older
/// than `max_age` is deleted. Returns the removed paths.
pub fn cleanup_stale_workspaces(config: &GitConfig) -> GitResult<Vec<PathBuf>> {
    cleanup_older_than(&config.workspace_root, config.workspace_max_age)
}

fn cleanup_older_than(root: &Path, max_age: Duration) -> GitResult<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(vec![]);
    }

    let mut removed = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();

        let is_workspace = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(PREFIX));
        if !is_workspace || !path.is_dir() {
            continue;
        }

        let modified = std::fs::metadata(&path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::MAX);

        // >= so that a zero max age removes everything immediately.
        if age >= max_age {
            tracing::info!(
                path = %path.display(),
                age_secs = age.as_secs(),
                "removing stale workspace"
            );
            std::fs::remove_dir_all(&path)?;
            removed.push(path);
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestRepos, sample_proposal};
    use crate::types::Endpoint;

    #[test]
    fn for_proposal_fetches_both_endpoints() {
        let repos = TestRepos::new();
        let main = repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");
        let feat = repos.commit_file("upstream", "feat", "b.txt", "b\n", "add b");

        let pr = sample_proposal(1, "feat", "main");
        let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();

        assert_eq!(ws.rev(BASE).unwrap(), main);
        assert_eq!(ws.rev(ORIGINAL_BASE).unwrap(), main);
        assert_eq!(ws.rev(TRACKING).unwrap(), feat);
    }

    #[test]
    fn fork_flow_reads_head_from_fork() {
        let repos = TestRepos::new();
        repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");
        repos.fork("upstream", "fork");
        let feat = repos.commit_file("fork", "feat", "b.txt", "b\n", "add b");

        let mut pr = sample_proposal(1, "feat", "main");
        pr.head = Endpoint::new(TestRepos::repo_id("fork"), "feat");

        let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();
        assert_eq!(ws.rev(TRACKING).unwrap(), feat);
    }

    #[test]
    fn direct_ref_flow_reads_internal_ref() {
        let repos = TestRepos::new();
        repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");
        let head = repos.commit_file("upstream", "scratch", "b.txt", "b\n", "add b");
        run_git_sync(
            &repos.path("upstream"),
            &["update-ref", "refs/pull/1/head", head.as_str()],
        )
        .unwrap();

        let mut pr = sample_proposal(1, "ignored", "main");
        pr.flow = Flow::DirectRef;

        let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();
        assert_eq!(ws.rev(TRACKING).unwrap(), head);
    }

    #[test]
    fn missing_head_branch_is_branch_not_found() {
        let repos = TestRepos::new();
        repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");

        let pr = sample_proposal(1, "gone", "main");
        let err = Workspace::for_proposal(&repos.config, &pr).unwrap_err();
        assert!(
            matches!(err, GitError::BranchNotFound { ref branch, .. } if branch == "gone"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn failed_creation_leaves_no_directory() {
        let repos = TestRepos::new();
        repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");

        let pr = sample_proposal(1, "gone", "main");
        assert!(Workspace::for_proposal(&repos.config, &pr).is_err());

        let leftovers = std::fs::read_dir(&repos.config.workspace_root)
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn drop_and_close_remove_directory() {
        let repos = TestRepos::new();

        let ws = Workspace::allocate(&repos.config, "x").unwrap();
        let dropped = ws.path().to_path_buf();
        drop(ws);
        assert!(!dropped.exists());

        let ws = Workspace::allocate(&repos.config, "y").unwrap();
        let closed = ws.path().to_path_buf();
        ws.close().unwrap();
        assert!(!closed.exists());
    }

    #[test]
    fn borrowed_objects_resolve_by_id() {
        let repos = TestRepos::new();
        let commit = repos.commit_file("upstream", "main", "a.txt", "a\n", "add a");

        let ws = Workspace::allocate(&repos.config, "borrow").unwrap();
        assert!(resolve_ref(ws.path(), commit.as_str()).unwrap().is_none());

        ws.borrow_objects(&repos.path("upstream")).unwrap();
        assert_eq!(resolve_ref(ws.path(), commit.as_str()).unwrap(), Some(commit));
    }

    #[test]
    fn concurrent_workspaces_are_distinct() {
        let repos = TestRepos::new();
        let a = Workspace::allocate(&repos.config, "7").unwrap();
        let b = Workspace::allocate(&repos.config, "7").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn stale_cleanup_only_touches_workspaces() {
        let repos = TestRepos::new();
        let ws = Workspace::allocate(&repos.config, "1").unwrap();
        let ws_path = ws.path().to_path_buf();
        std::mem::forget(ws);

        let unrelated = repos.config.workspace_root.join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        let removed = cleanup_older_than(&repos.config.workspace_root, Duration::ZERO).unwrap();
        assert_eq!(removed, vec![ws_path.clone()]);
        assert!(!ws_path.exists());
        assert!(unrelated.exists());
    }
}
