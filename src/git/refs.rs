//! Commit range queries.

use std::path::Path;

use crate::types::{Sha, Signature};

use super::{GitResult, run_git_stdout};

/// A commit as read from `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: Sha,
    pub author: Signature,
    pub message: String,
}

const RECORD_SEP: char = '\u{1e}';
const FIELD_SEP: char = '\0';

/// Commits reachable from `include` but not `exclude`, oldest first.
pub fn commits_between(workdir: &Path, exclude: &str, include: &str) -> GitResult<Vec<CommitSummary>> {
    let range = format!("{}..{}", exclude, include);
    let out = run_git_stdout(
        workdir,
        &[
            "log",
            "--reverse",
            "--topo-order",
            "--format=%H%x00%an%x00%ae%x00%B%x1e",
            &range,
        ],
    )?;

    let mut commits = Vec::new();
    for record in out.split(RECORD_SEP) {
        let record = record.trim_start_matches('\n');
        if record.is_empty() {
            continue;
        }
        let mut fields = record.splitn(4, FIELD_SEP);
        let (Some(sha), Some(name), Some(email), Some(message)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        commits.push(CommitSummary {
            sha: Sha::parse(sha)?,
            author: Signature {
                name: name.to_string(),
                email: email.to_string(),
            },
            message: message.trim_end().to_string(),
        });
    }
    Ok(commits)
}

/// Non-merge commits in `exclude..include`, oldest first, for replaying.
pub fn commits_to_replay(workdir: &Path, exclude: &str, include: &str) -> GitResult<Vec<Sha>> {
    let range = format!("{}..{}", exclude, include);
    let out = run_git_stdout(
        workdir,
        &["rev-list", "--reverse", "--topo-order", "--no-merges", &range],
    )?;
    out.lines()
        .filter(|line| !line.is_empty())
        .map(|line| Ok(Sha::parse(line)?))
        .collect()
}

/// Author identity and full message of a single commit.
pub fn commit_summary(workdir: &Path, commit: &str) -> GitResult<CommitSummary> {
    let out = run_git_stdout(
        workdir,
        &["show", "-s", "--format=%H%x00%an%x00%ae%x00%B", commit],
    )?;
    let mut fields = out.splitn(4, FIELD_SEP);
    let sha = Sha::parse(fields.next().unwrap_or_default())?;
    let name = fields.next().unwrap_or_default().to_string();
    let email = fields.next().unwrap_or_default().to_string();
    let message = fields.next().unwrap_or_default().trim_end().to_string();
    Ok(CommitSummary {
        sha,
        author: Signature { name, email },
        message,
    })
}

/// The oldest commit of `branch` that descends from `commit`, or `None`
/// when `commit` is the tip of `branch` itself.
pub fn first_descendant(workdir: &Path, commit: &str, branch: &str) -> GitResult<Option<Sha>> {
    let range = format!("{}..{}", commit, branch);
    let out = run_git_stdout(workdir, &["rev-list", "--ancestry-path", "--reverse", &range])?;
    match out.lines().next() {
        Some(line) => Ok(Some(Sha::parse(line)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRepos;

    #[test]
    fn commits_between_is_oldest_first_with_authors() {
        let repos = TestRepos::new();
        let root = repos.commit_file("upstream", "main", "a.txt", "a\n", "root");
        let alice = Signature {
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
        };
        let first = repos.commit_file_as(
            "upstream",
            "main",
            "b.txt",
            "b\n",
            "fix: a\n\nlonger body",
            &alice,
        );
        let second = repos.commit_file("upstream", "main", "c.txt", "c\n", "fix: b");

        let commits =
            commits_between(&repos.path("upstream"), root.as_str(), second.as_str()).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].sha, first);
        assert_eq!(commits[0].author, alice);
        assert_eq!(commits[0].message, "fix: a\n\nlonger body");
        assert_eq!(commits[1].sha, second);
        assert_eq!(commits[1].message, "fix: b");

        assert_eq!(
            commits_to_replay(&repos.path("upstream"), root.as_str(), second.as_str()).unwrap(),
            vec![first.clone(), second]
        );
        assert_eq!(
            commit_summary(&repos.path("upstream"), first.as_str())
                .unwrap()
                .author,
            alice
        );
    }

    #[test]
    fn empty_range() {
        let repos = TestRepos::new();
        let root = repos.commit_file("upstream", "main", "a.txt", "a\n", "root");
        let path = repos.path("upstream");
        assert!(commits_between(&path, root.as_str(), root.as_str()).unwrap().is_empty());
        assert!(commits_to_replay(&path, root.as_str(), root.as_str()).unwrap().is_empty());
    }
}
