//! Default commit message for squash merges.
//!
//! [`compose_squash_message`] is pure: the commit range is read elsewhere and
//! account lookups are passed in as a closure.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::git::refs::CommitSummary;
use crate::types::{Actor, UserId};

/// A message that already ends in `Key: value` trailers.
static TRAILERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\n\n)(?:[\w-]+[ \t]*:[^\n]+\n*(?:[ \t]+[^\n]+\n*)*)+$")
        .expect("trailer pattern is valid")
});

const ELLIPSIS: &str = "...";

/// Limits applied while composing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashBudget {
    /// Build the body from commit messages instead of the description.
    pub populate_from_commits: bool,

    /// How many of the newest commits contribute messages and authors.
    /// `None` reads the whole range.
    pub message_commits: Option<usize>,

    /// Stop appending commit messages once the body reaches this many bytes.
    pub max_size: Option<usize>,

    /// How many commits older than the message window are scanned for
    /// co-authors only. `None` scans the rest of the range.
    pub extra_author_commits: Option<usize>,
}

impl Default for SquashBudget {
    fn default() -> Self {
        SquashBudget {
            populate_from_commits: false,
            message_commits: Some(50),
            max_size: Some(5 * 1024),
            extra_author_commits: None,
        }
    }
}

/// What a squash message is built from.
#[derive(Debug, Clone, Copy)]
pub struct SquashInput<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub poster: &'a Actor,
    /// The range between merge base and head, oldest first.
    pub commits: &'a [CommitSummary],
}

/// Composes the squash commit body.
///
/// `resolve_account` maps a commit email to an account so that authors who
/// are the poster under another address are not credited as co-authors.
pub fn compose_squash_message(
    input: &SquashInput<'_>,
    budget: &SquashBudget,
    resolve_account: impl Fn(&str) -> Option<UserId>,
) -> String {
    let mut out = String::new();

    if !budget.populate_from_commits {
        let description = input.description.trim();
        out.push_str(description);
        if !out.is_empty() {
            out.push('\n');
            if !TRAILERS.is_match(description) {
                out.push('\n');
            }
        }
    }

    let total = input.commits.len();
    let window = budget.message_commits.map_or(total, |n| n.min(total));
    let (older, recent) = input.commits.split_at(total - window);

    let poster = input.poster.signature().to_string();
    let mut seen = HashSet::new();
    let mut co_authors = Vec::new();
    let mut credit = |commit: &CommitSummary| {
        let author = commit.author.to_string();
        if author == poster || !seen.insert(author.clone()) {
            return;
        }
        if resolve_account(&commit.author.email) != Some(input.poster.id) {
            co_authors.push(author);
        }
    };

    for (i, commit) in recent.iter().enumerate() {
        if budget.populate_from_commits && budget.max_size.is_none_or(|max| out.len() < max) {
            let message = if i == 0 {
                commit
                    .message
                    .strip_prefix(input.title)
                    .unwrap_or(&commit.message)
                    .trim_start()
            } else {
                commit.message.as_str()
            };
            if !message.is_empty() {
                append_within(&mut out, message, budget.max_size);
                out.push('\n');
            }
        }
        credit(commit);
    }

    let extra = budget.extra_author_commits.unwrap_or(older.len());
    for commit in older.iter().rev().take(extra) {
        credit(commit);
    }

    for author in co_authors {
        out.push_str("Co-authored-by: ");
        out.push_str(&author);
        out.push('\n');
    }

    out
}

fn append_within(out: &mut String, message: &str, max_size: Option<usize>) {
    let remaining = max_size.map_or(usize::MAX, |max| max.saturating_sub(out.len()));
    if message.len() <= remaining {
        out.push_str(message);
        return;
    }
    let mut cut = remaining;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    out.push_str(&message[..cut]);
    out.push_str(ELLIPSIS);
}
