//! Ref propagation between hosted repositories.
//!
//! A proposal's head becomes visible in the base repository under its
//! internal ref (`refs/<prefix>/<index>/head`):
//!
//! - fork flow: force-push the head branch from the head repository
//! - direct-ref flow: `update-ref` the internal ref in place
//!
//! Push failures are classified here, once, from git's stderr. Callers match
//! on [`PropagateError`] and never look at the text again.

use std::path::Path;

use thiserror::Error;

use crate::types::{Flow, Proposal, Sha};

use super::{GitConfig, GitError, GitResult, branch_exists, git_command, run_git_sync};

/// Why a push did not land.
#[derive(Debug, Error)]
pub enum PropagateError {
    /// The remote ref moved since we last saw it.
    #[error("push rejected: remote ref is out of date\n{stderr}")]
    OutOfDate { stderr: String },

    /// The remote refused the update (hook, protection).
    #[error("push rejected by remote\nstdout: {stdout}\nstderr: {stderr}")]
    Rejected { stdout: String, stderr: String },

    /// The source name matched both a branch and another ref.
    #[error("ambiguous source ref in {refspec}\n{stderr}")]
    AmbiguousRef { refspec: String, stderr: String },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl PropagateError {
    pub fn is_ambiguous_ref(&self) -> bool {
        matches!(self, PropagateError::AmbiguousRef { .. })
    }
}

/// Result type for propagation.
pub type PropagateResult<T> = Result<T, PropagateError>;

/// Runs `git push` and classifies a failure.
fn push(workdir: &Path, args: &[&str]) -> PropagateResult<()> {
    let output = git_command(workdir)
        .arg("push")
        .args(args)
        .output()
        .map_err(GitError::Io)?;
    if output.status.success() {
        return Ok(());
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Err(classify_push_failure(args, stdout, stderr))
}

fn classify_push_failure(args: &[&str], stdout: String, stderr: String) -> PropagateError {
    if stderr.contains("matches more than one") {
        return PropagateError::AmbiguousRef {
            refspec: args.last().copied().unwrap_or_default().to_string(),
            stderr,
        };
    }

    if stderr.contains("(fetch first)")
        || stderr.contains("non-fast-forward")
        || stderr.contains("stale info")
    {
        return PropagateError::OutOfDate { stderr };
    }

    if stderr.contains("[remote rejected]")
        || stderr.contains("hook declined")
        || stderr.contains("rejected")
    {
        return PropagateError::Rejected { stdout, stderr };
    }

    PropagateError::Git(GitError::CommandFailed {
        command: format!("git push {}", args.join(" ")),
        stderr,
    })
}

/// Makes `head_commit` (direct-ref flow) or the head branch tip (fork flow)
/// visible under the proposal's internal ref.
pub fn propagate_head(
    config: &GitConfig,
    proposal: &Proposal,
    head_commit: Option<&Sha>,
) -> PropagateResult<()> {
    match (proposal.flow, head_commit) {
        (Flow::DirectRef, Some(commit)) => update_internal_ref(config, proposal, commit),
        (Flow::DirectRef, None) => Ok(()),
        (Flow::Fork, _) => push_to_internal_ref(config, proposal),
    }
}

/// Force-pushes the head branch into the base repository's internal ref.
///
/// If the branch name is ambiguous in the head repository (a tag or other
/// ref with the same short name), retries exactly once with the fully
/// qualified `refs/heads/<branch>`. A second failure is returned as is.
pub fn push_to_internal_ref(config: &GitConfig, proposal: &Proposal) -> PropagateResult<()> {
    let head_path = config.repo_path(&proposal.head.repo);
    let base_path = config.repo_path(&proposal.base.repo);
    let internal = proposal.internal_ref(&config.ref_prefix);

    if !head_path.exists() || !branch_exists(&head_path, &proposal.head.branch)? {
        return Err(GitError::BranchNotFound {
            repo: proposal.head.repo.clone(),
            branch: proposal.head.branch.clone(),
        }
        .into());
    }

    let remote = base_path.to_string_lossy();
    let result = with_qualified_retry(&proposal.head.branch, |source| {
        let refspec = format!("{}:{}", source, internal);
        push(&head_path, &["--force", "--quiet", &remote, &refspec])
    });
    match &result {
        Err(PropagateError::AmbiguousRef { .. }) => tracing::warn!(
            proposal = %proposal.id,
            branch = %proposal.head.branch,
            "head branch still ambiguous after qualified retry"
        ),
        // A forced push should never be out of date.
        Err(PropagateError::OutOfDate { stderr }) => tracing::error!(
            proposal = %proposal.id,
            internal_ref = %internal,
            stderr = %stderr,
            "forced push to internal ref reported out of date"
        ),
        _ => {}
    }
    result
}

/// Runs `attempt` with the short branch name, and once more with
/// `refs/heads/<branch>` if the first attempt hit an ambiguous ref.
fn with_qualified_retry(
    branch: &str,
    mut attempt: impl FnMut(&str) -> PropagateResult<()>,
) -> PropagateResult<()> {
    match attempt(branch) {
        Err(PropagateError::AmbiguousRef { .. }) => {
            tracing::info!(%branch, "ambiguous branch name, retrying with refs/heads/ prefix");
            attempt(&format!("refs/heads/{}", branch))
        }
        other => other,
    }
}

/// Points the internal ref directly at `commit` in the base repository.
///
/// Unlike the fork flow there is no retry: update-ref takes a fully
/// qualified ref name and cannot be ambiguous.
pub fn update_internal_ref(
    config: &GitConfig,
    proposal: &Proposal,
    commit: &Sha,
) -> PropagateResult<()> {
    let base_path = config.repo_path(&proposal.base.repo);
    let internal = proposal.internal_ref(&config.ref_prefix);
    run_git_sync(&base_path, &["update-ref", &internal, commit.as_str()])?;
    Ok(())
}

/// Deletes the proposal's internal ref. Missing refs are not an error.
pub fn remove_internal_ref(config: &GitConfig, proposal: &Proposal) -> GitResult<()> {
    let base_path = config.repo_path(&proposal.base.repo);
    let internal = proposal.internal_ref(&config.ref_prefix);
    run_git_sync(&base_path, &["update-ref", "-d", &internal])?;
    Ok(())
}

/// Pushes a commit from a workspace to a branch of a hosted repository.
///
/// Without a lease the push only succeeds as a fast-forward. With
/// `lease = Some(old)` history may be rewritten, but only while the branch
/// is still at `old`. Either way a branch that moved since the workspace
/// fetched it yields [`PropagateError::OutOfDate`].
pub fn push_commit(
    workdir: &Path,
    repo_path: &Path,
    commit: &Sha,
    branch: &str,
    lease: Option<&Sha>,
) -> PropagateResult<()> {
    let remote = repo_path.to_string_lossy();
    let refspec = format!("{}:refs/heads/{}", commit, branch);
    let lease = lease.map(|old| format!("--force-with-lease=refs/heads/{}:{}", branch, old));
    let mut args = vec!["--quiet"];
    if let Some(lease) = &lease {
        args.push(lease);
    }
    args.push(&remote);
    args.push(&refspec);
    push(workdir, &args)
}

/// Deletes a branch in a hosted repository if it still points at `expected`.
pub fn delete_branch(repo_path: &Path, branch: &str, expected: &Sha) -> GitResult<()> {
    run_git_sync(
        repo_path,
        &[
            "update-ref",
            "-d",
            &format!("refs/heads/{}", branch),
            expected.as_str(),
        ],
    )?;
    Ok(())
}
