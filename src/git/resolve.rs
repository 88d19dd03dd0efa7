//! Three-way merges inside a workspace.
//!
//! Two strategies produce the same [`MergeOutcome`]:
//!
//! - [`ResolverStrategy::MergeTree`]: `git merge-tree --write-tree`, which
//!   needs git 2.40 for `--merge-base`
//! - [`ResolverStrategy::IndexMerge`]: `read-tree -m` into a private index,
//!   `merge-file` for each unmerged path, then `write-tree`
//!
//! Neither touches a working copy. Cherry-pick and revert are three-way
//! merges with the commit's parent as ancestor (swapped for revert).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Sha;

use super::divergence::merge_base;
use super::{
    GitError, GitResult, command_failed, get_parents, git_command, git_version, run_git_stdout,
};

/// Result of a three-way merge attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge produced a tree.
    Clean { tree: Sha },

    /// The merge conflicted in these paths (possibly none are nameable).
    Conflict { paths: Vec<String> },

    /// The inputs share no common ancestor.
    StructuralFailure,
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeOutcome::Conflict { .. })
    }
}

/// How a three-way merge is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverStrategy {
    MergeTree,
    IndexMerge,
}

impl ResolverStrategy {
    /// Picks `MergeTree` when the installed git supports it.
    pub fn detect(workdir: &Path) -> GitResult<Self> {
        let version = git_version(workdir)?;
        Ok(if version >= (2, 40) {
            ResolverStrategy::MergeTree
        } else {
            ResolverStrategy::IndexMerge
        })
    }
}

impl fmt::Display for ResolverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverStrategy::MergeTree => f.write_str("merge-tree"),
            ResolverStrategy::IndexMerge => f.write_str("index-merge"),
        }
    }
}

impl std::str::FromStr for ResolverStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge-tree" => Ok(ResolverStrategy::MergeTree),
            "index-merge" => Ok(ResolverStrategy::IndexMerge),
            other => Err(format!("unknown resolver strategy: {}", other)),
        }
    }
}

/// One side of a three-way merge.
#[derive(Debug, Clone, Copy)]
enum Side<'a> {
    Commit(&'a str),
    EmptyTree,
}

/// Merges `theirs` into `ours` around their merge base.
pub fn merge(
    workdir: &Path,
    strategy: ResolverStrategy,
    ours: &str,
    theirs: &str,
) -> GitResult<MergeOutcome> {
    let Some(ancestor) = merge_base(workdir, ours, theirs)? else {
        return Ok(MergeOutcome::StructuralFailure);
    };
    three_way(
        workdir,
        strategy,
        Side::Commit(ancestor.as_str()),
        ours,
        Side::Commit(theirs),
    )
}

/// Applies the change introduced by `commit` on top of `onto`.
pub fn cherry_pick(
    workdir: &Path,
    strategy: ResolverStrategy,
    onto: &str,
    commit: &str,
) -> GitResult<MergeOutcome> {
    let parent = get_parents(workdir, commit)?.into_iter().next();
    let ancestor = match &parent {
        Some(parent) => Side::Commit(parent.as_str()),
        None => Side::EmptyTree,
    };
    three_way(workdir, strategy, ancestor, onto, Side::Commit(commit))
}

/// Undoes the change introduced by `commit` on top of `onto`.
pub fn revert(
    workdir: &Path,
    strategy: ResolverStrategy,
    onto: &str,
    commit: &str,
) -> GitResult<MergeOutcome> {
    let parent = get_parents(workdir, commit)?.into_iter().next();
    let theirs = match &parent {
        Some(parent) => Side::Commit(parent.as_str()),
        None => Side::EmptyTree,
    };
    three_way(workdir, strategy, Side::Commit(commit), onto, theirs)
}

fn three_way(
    workdir: &Path,
    strategy: ResolverStrategy,
    ancestor: Side<'_>,
    ours: &str,
    theirs: Side<'_>,
) -> GitResult<MergeOutcome> {
    // merge-tree only takes commits; the empty tree needs the index path.
    match (strategy, ancestor, theirs) {
        (ResolverStrategy::MergeTree, Side::Commit(base), Side::Commit(theirs)) => {
            merge_tree(workdir, base, ours, theirs)
        }
        _ => {
            let empty = empty_tree(workdir)?;
            let resolve = |side: Side<'_>| match side {
                Side::Commit(c) => c.to_string(),
                Side::EmptyTree => empty.to_string(),
            };
            index_merge(workdir, &resolve(ancestor), ours, &resolve(theirs))
        }
    }
}

fn merge_tree(workdir: &Path, base: &str, ours: &str, theirs: &str) -> GitResult<MergeOutcome> {
    let merge_base_arg = format!("--merge-base={}", base);
    let args = [
        "merge-tree",
        "--write-tree",
        "--name-only",
        "--no-messages",
        &merge_base_arg,
        ours,
        theirs,
    ];
    let output = git_command(workdir).args(args).output()?;

    // Exit 0 = clean, exit 1 = conflicts, other = error
    let conflicted = match output.status.code() {
        Some(0) => false,
        Some(1) => true,
        _ => return Err(command_failed(&args, &output)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    let tree = Sha::parse(lines.next().unwrap_or_default())?;

    if !conflicted {
        return Ok(MergeOutcome::Clean { tree });
    }

    // With --name-only the conflicted-file section is one path per line,
    // terminated by a blank line before the (suppressed) messages.
    let paths: BTreeSet<String> = lines
        .take_while(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok(MergeOutcome::Conflict {
        paths: paths.into_iter().collect(),
    })
}

/// One stage of an unmerged index entry.
#[derive(Debug, Clone)]
struct Entry {
    mode: String,
    object: String,
}

/// An unmerged index entry: stage 1 (ancestor), 2 (ours) or 3 (theirs).
#[derive(Debug, Default)]
struct Stages {
    ancestor: Option<Entry>,
    ours: Option<Entry>,
    theirs: Option<Entry>,
}

impl Stages {
    /// The mode the merged entry takes, or `None` when both sides changed
    /// it differently.
    fn merged_mode(&self, ours: &Entry, theirs: &Entry) -> Option<String> {
        let base = self.ancestor.as_ref().map(|a| a.mode.as_str());
        if ours.mode == theirs.mode || base == Some(theirs.mode.as_str()) {
            Some(ours.mode.clone())
        } else if base == Some(ours.mode.as_str()) {
            Some(theirs.mode.clone())
        } else {
            None
        }
    }
}

/// git's heuristic: a NUL byte in the first 8000 bytes marks binary content.
fn is_binary(content: &[u8]) -> bool {
    content.iter().take(8000).any(|b| *b == 0)
}

fn index_merge(workdir: &Path, base: &str, ours: &str, theirs: &str) -> GitResult<MergeOutcome> {
    let scratch = tempfile::Builder::new()
        .prefix("merge-")
        .tempdir_in(workdir)?;
    let index = scratch.path().join("index");
    let git = |args: &[&str]| -> GitResult<std::process::Output> {
        let output = git_command(workdir)
            .env("GIT_INDEX_FILE", &index)
            .args(args)
            .output()?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_failed(args, &output))
        }
    };

    git(&["read-tree", "-m", "-i", "--aggressive", base, ours, theirs])?;

    let unmerged = git(&["ls-files", "-u", "-z"])?;
    let mut entries: BTreeMap<String, Stages> = BTreeMap::new();
    for record in unmerged.stdout.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        // "<mode> <object> <stage>\t<path>"
        let Some((meta, path)) = record.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split(' ');
        let (Some(mode), Some(object), Some(stage)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let entry = Entry {
            mode: mode.to_string(),
            object: object.to_string(),
        };
        let stages = entries.entry(path.to_string()).or_default();
        match stage {
            "1" => stages.ancestor = Some(entry),
            "2" => stages.ours = Some(entry),
            "3" => stages.theirs = Some(entry),
            _ => {}
        }
    }

    let mut conflicts = Vec::new();
    for (path, stages) in &entries {
        let (Some(ours_entry), Some(theirs_entry)) = (&stages.ours, &stages.theirs) else {
            // Modified on one side, deleted on the other.
            conflicts.push(path.clone());
            continue;
        };
        let Some(mode) = stages.merged_mode(ours_entry, theirs_entry) else {
            conflicts.push(path.clone());
            continue;
        };

        let ancestor_blob = match &stages.ancestor {
            Some(entry) => read_blob(workdir, &entry.object)?,
            None => Vec::new(),
        };
        let ours_blob = read_blob(workdir, &ours_entry.object)?;
        let theirs_blob = read_blob(workdir, &theirs_entry.object)?;

        let blob = if ours_blob == theirs_blob || theirs_blob == ancestor_blob {
            ours_entry.object.clone()
        } else if ours_blob == ancestor_blob {
            theirs_entry.object.clone()
        } else if [&ancestor_blob, &ours_blob, &theirs_blob]
            .into_iter()
            .any(|content| is_binary(content))
        {
            // merge-file refuses binary content; both sides changed it.
            conflicts.push(path.clone());
            continue;
        } else {
            let ancestor_file = scratch.path().join("ancestor");
            let ours_file = scratch.path().join("ours");
            let theirs_file = scratch.path().join("theirs");
            std::fs::write(&ancestor_file, &ancestor_blob)?;
            std::fs::write(&ours_file, &ours_blob)?;
            std::fs::write(&theirs_file, &theirs_blob)?;

            let merge_args = [
                "merge-file",
                "-p",
                ours_file.to_str().unwrap_or_default(),
                ancestor_file.to_str().unwrap_or_default(),
                theirs_file.to_str().unwrap_or_default(),
            ];
            let merged = git_command(workdir).args(merge_args).output()?;

            // Exit status is the number of conflicts; negative means error.
            match merged.status.code() {
                Some(0) => {}
                Some(n) if n > 0 && n < 128 => {
                    conflicts.push(path.clone());
                    continue;
                }
                _ => return Err(command_failed(&merge_args, &merged)),
            }

            let merged_file = scratch.path().join("merged");
            std::fs::write(&merged_file, &merged.stdout)?;
            run_git_stdout(
                workdir,
                &["hash-object", "-w", merged_file.to_str().unwrap_or_default()],
            )?
        };

        git(&["update-index", "--force-remove", "--", path])?;
        git(&[
            "update-index",
            "--add",
            "--cacheinfo",
            &format!("{},{},{}", mode, blob, path),
        ])?;
    }

    if !conflicts.is_empty() {
        return Ok(MergeOutcome::Conflict { paths: conflicts });
    }

    let tree = git(&["write-tree"])?;
    let tree = Sha::parse(String::from_utf8_lossy(&tree.stdout).trim())?;
    Ok(MergeOutcome::Clean { tree })
}

fn read_blob(workdir: &Path, blob: &str) -> GitResult<Vec<u8>> {
    let args = ["cat-file", "blob", blob];
    let output = git_command(workdir).args(args).output()?;
    if !output.status.success() {
        return Err(command_failed(&args, &output));
    }
    Ok(output.stdout)
}

/// The empty tree in the workspace's object format.
pub fn empty_tree(workdir: &Path) -> GitResult<Sha> {
    let sha = run_git_stdout(workdir, &["hash-object", "-t", "tree", "-w", "/dev/null"])?;
    Sha::parse(&sha).map_err(GitError::from)
}

/// Paths whose content differs between two commits.
pub fn changed_paths(workdir: &Path, from: &str, to: &str) -> GitResult<Vec<String>> {
    let out = run_git_stdout(workdir, &["diff", "--name-only", "--no-renames", from, to])?;
    Ok(out.lines().map(str::to_string).collect())
}
