//! The VCS capability: git plumbing run as subprocesses.
//!
//! This module implements the git operations the engine needs:
//! - Temporary workspaces (isolated clones holding `base` and `tracking` refs)
//! - Divergence and merge-base computation
//! - Three-way conflict resolution (merge-tree or index based)
//! - Ref propagation between repositories (force push or direct update-ref)
//!
//! Real repositories are only ever mutated through push and update-ref. All
//! merging happens inside a workspace.

pub mod divergence;
pub mod propagate;
pub mod refs;
pub mod resolve;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use thiserror::Error;

use crate::types::{InvalidSha, RepoId, Sha, Signature};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// A branch an operation depends on does not exist.
    #[error("branch {branch} does not exist in {repo}")]
    BranchNotFound { repo: RepoId, branch: String },

    /// Workspace allocation or removal failed.
    #[error("workspace error: {details}")]
    Workspace { details: String },

    /// Invalid SHA format.
    #[error(transparent)]
    InvalidSha(#[from] InvalidSha),

    /// IO error (including a missing git binary).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Where repositories and workspaces live on disk.
#[derive(Debug, Clone)]
pub struct GitConfig {
    /// Root of the hosted bare repositories (`<root>/<owner>/<repo>.git`).
    pub repos_root: PathBuf,

    /// Directory under which temporary workspaces are allocated.
    pub workspace_root: PathBuf,

    /// Namespace of internal proposal refs (`refs/<prefix>/<index>/head`).
    pub ref_prefix: String,

    /// Leftover workspaces older than this are removed on startup.
    pub workspace_max_age: Duration,
}

impl GitConfig {
    /// Returns the path to a hosted repository.
    pub fn repo_path(&self, repo: &RepoId) -> PathBuf {
        self.repos_root
            .join(&repo.owner)
            .join(format!("{}.git", repo.repo))
    }
}

/// Create a git Command with clean environment (no system/user config).
///
/// This ensures consistent behavior across different machines by ignoring
/// system and user git configuration (e.g., rerere, hooks, aliases).
pub(crate) fn git_command(workdir: &Path) -> std::process::Command {
    use std::process::Command;

    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);

    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    cmd
}

/// Create a git Command that records the given author and committer.
///
/// Identity is passed through the environment so that author and committer
/// can differ (squash merges keep the poster as author).
pub(crate) fn git_commit_command(
    workdir: &Path,
    author: &Signature,
    committer: &Signature,
) -> std::process::Command {
    let mut cmd = git_command(workdir);
    cmd.env("GIT_AUTHOR_NAME", &author.name);
    cmd.env("GIT_AUTHOR_EMAIL", &author.email);
    cmd.env("GIT_COMMITTER_NAME", &committer.name);
    cmd.env("GIT_COMMITTER_EMAIL", &committer.email);
    cmd
}

/// Run a git command in the given working directory.
///
/// Returns the command output on success, or a GitError on failure.
pub fn run_git_sync(workdir: &Path, args: &[&str]) -> GitResult<Output> {
    let output = git_command(workdir).args(args).output()?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(command_failed(args, &output))
    }
}

/// Run a git command and return stdout as a string.
pub fn run_git_stdout(workdir: &Path, args: &[&str]) -> GitResult<String> {
    let output = run_git_sync(workdir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub(crate) fn command_failed(args: &[&str], output: &Output) -> GitError {
    GitError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// Check if one commit is an ancestor of another.
pub fn is_ancestor(workdir: &Path, potential_ancestor: &str, descendant: &str) -> GitResult<bool> {
    let args = [
        "merge-base",
        "--is-ancestor",
        potential_ancestor,
        descendant,
    ];
    let output = git_command(workdir).args(args).output()?;

    // Exit 0 = is ancestor, exit 1 = not ancestor, other = error
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(command_failed(&args, &output)),
    }
}

/// Get the SHA of a revision.
pub fn rev_parse(workdir: &Path, rev: &str) -> GitResult<Sha> {
    let sha_str = run_git_stdout(workdir, &["rev-parse", "--verify", rev])?;
    Ok(Sha::parse(&sha_str)?)
}

/// Get the tree SHA for a commit.
pub fn get_tree_sha(workdir: &Path, commit: &str) -> GitResult<Sha> {
    rev_parse(workdir, &format!("{}^{{tree}}", commit))
}

/// Get the parent SHA(s) for a commit.
pub fn get_parents(workdir: &Path, commit: &str) -> GitResult<Vec<Sha>> {
    let output = run_git_stdout(workdir, &["rev-parse", &format!("{}^@", commit)])?;
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| Ok(Sha::parse(line)?))
        .collect()
}

/// Resolve a ref to a commit, returning `None` when it does not exist.
pub fn resolve_ref(workdir: &Path, refname: &str) -> GitResult<Option<Sha>> {
    let args = [
        "rev-parse",
        "--verify",
        "--quiet",
        &format!("{}^{{commit}}", refname),
    ];
    let output = git_command(workdir).args(args).output()?;

    match output.status.code() {
        Some(0) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(Some(Sha::parse(stdout.trim())?))
        }
        Some(1) => Ok(None),
        _ => Err(command_failed(&args, &output)),
    }
}

/// Check whether `refs/heads/<branch>` exists in a repository.
pub fn branch_exists(repo_path: &Path, branch: &str) -> GitResult<bool> {
    Ok(resolve_ref(repo_path, &format!("refs/heads/{}", branch))?.is_some())
}

/// Create a commit object for `tree` with the given parents.
pub fn commit_tree(
    workdir: &Path,
    tree: &Sha,
    parents: &[&Sha],
    message: &str,
    author: &Signature,
    committer: &Signature,
) -> GitResult<Sha> {
    let mut args: Vec<String> = vec!["commit-tree".to_string(), tree.to_string()];
    for parent in parents {
        args.push("-p".to_string());
        args.push(parent.to_string());
    }
    // An empty message is rejected by some hooks; keep at least a newline.
    args.push("-m".to_string());
    args.push(if message.trim().is_empty() {
        "\n".to_string()
    } else {
        message.to_string()
    });

    let output = git_commit_command(workdir, author, committer)
        .args(&args)
        .output()?;
    if !output.status.success() {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        return Err(command_failed(&arg_refs, &output));
    }

    Ok(Sha::parse(String::from_utf8_lossy(&output.stdout).trim())?)
}

/// The installed git version as `(major, minor)`.
pub fn git_version(workdir: &Path) -> GitResult<(u32, u32)> {
    let out = run_git_stdout(workdir, &["version"])?;
    parse_git_version(&out).ok_or_else(|| GitError::CommandFailed {
        command: "git version".to_string(),
        stderr: format!("unrecognized version string: {}", out),
    })
}

fn parse_git_version(s: &str) -> Option<(u32, u32)> {
    // "git version 2.43.0" or "git version 2.39.3 (Apple Git-145)"
    let version = s.strip_prefix("git version ")?.split_whitespace().next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
