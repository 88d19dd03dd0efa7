//! Ahead/behind computation inside a workspace.

use std::path::Path;

use crate::types::{Divergence, Sha};

use super::workspace::{BASE, TRACKING, Workspace};
use super::{GitError, GitResult, command_failed, git_command, run_git_stdout};

/// Counts commits on `tracking` not on `base` (ahead) and vice versa (behind).
pub fn divergence(ws: &Workspace) -> GitResult<Divergence> {
    count_left_right(ws.path(), BASE, TRACKING)
}

fn count_left_right(workdir: &Path, base: &str, head: &str) -> GitResult<Divergence> {
    let range = format!("{}...{}", base, head);
    let out = run_git_stdout(workdir, &["rev-list", "--left-right", "--count", &range])?;

    // "<left>\t<right>": left is base-only (behind), right is head-only (ahead)
    let mut counts = out.split_whitespace().map(str::parse::<u64>);
    match (counts.next(), counts.next()) {
        (Some(Ok(behind)), Some(Ok(ahead))) => Ok(Divergence { ahead, behind }),
        _ => Err(GitError::CommandFailed {
            command: format!("git rev-list --left-right --count {}", range),
            stderr: format!("unexpected output: {:?}", out),
        }),
    }
}

/// Nearest common ancestor of two commits, or `None` for unrelated histories.
pub fn merge_base(workdir: &Path, a: &str, b: &str) -> GitResult<Option<Sha>> {
    let args = ["merge-base", a, b];
    let output = git_command(workdir).args(args).output()?;

    // Exit 1 with no output means there is no common ancestor.
    match output.status.code() {
        Some(0) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(Some(Sha::parse(stdout.trim())?))
        }
        Some(1) if output.stdout.is_empty() => Ok(None),
        _ => Err(command_failed(&args, &output)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestRepos, sample_proposal};
    use proptest::prelude::*;
    use proptest::test_runner::Config as ProptestConfig;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(6))]

        /// Head n commits ahead of base and 0 behind reports (n, 0).
        #[test]
        fn head_ahead_only(n in 1usize..5) {
            let repos = TestRepos::new();
            repos.commit_file("upstream", "main", "base.txt", "base\n", "base");
            let main = repos.tip("upstream", "main");
            repos.set_branch("upstream", "feat", &main);
            for i in 0..n {
                repos.commit_file(
                    "upstream",
                    "feat",
                    &format!("f{}.txt", i),
                    &format!("{}\n", i),
                    &format!("feat {}", i),
                );
            }

            let pr = sample_proposal(1, "feat", "main");
            let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();
            prop_assert_eq!(
                divergence(&ws).unwrap(),
                Divergence { ahead: n as u64, behind: 0 }
            );
        }
    }

    #[test]
    fn both_sides_moved() {
        let repos = TestRepos::new();
        let root = repos.commit_file("upstream", "main", "base.txt", "base\n", "base");
        repos.set_branch("upstream", "feat", &root);
        repos.commit_file("upstream", "feat", "f.txt", "f\n", "feat");
        repos.commit_file("upstream", "main", "m1.txt", "m1\n", "main 1");
        repos.commit_file("upstream", "main", "m2.txt", "m2\n", "main 2");

        let pr = sample_proposal(1, "feat", "main");
        let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();
        assert_eq!(
            divergence(&ws).unwrap(),
            Divergence {
                ahead: 1,
                behind: 2
            }
        );
        assert_eq!(
            merge_base(ws.path(), BASE, TRACKING).unwrap(),
            Some(root)
        );
    }

    #[test]
    fn unrelated_histories_have_no_merge_base() {
        let repos = TestRepos::new();
        repos.commit_file("upstream", "main", "a.txt", "a\n", "main root");
        repos.commit_file("upstream", "orphan", "b.txt", "b\n", "orphan root");

        let pr = sample_proposal(1, "orphan", "main");
        let ws = Workspace::for_proposal(&repos.config, &pr).unwrap();
        assert_eq!(merge_base(ws.path(), BASE, TRACKING).unwrap(), None);
    }
}
