//! Audit records appended alongside proposal updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProposalId, Sha, UserId};
use super::proposal::MergeStyle;

/// A visible history record on a proposal's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub proposal: ProposalId,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn now(proposal: ProposalId, actor: UserId, event: HistoryEvent) -> Self {
        HistoryEntry {
            proposal,
            actor,
            at: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    Opened,
    /// Commits pushed to the head, newest last.
    PushedCommits {
        commits: Vec<Sha>,
        force: bool,
    },
    ChangedTargetBranch {
        old: String,
        new: String,
    },
    ChangedTitle {
        old: String,
        new: String,
    },
    Merged {
        commit: Sha,
        style: MergeStyle,
    },
    /// The head turned up in the base branch without a recorded merge.
    ManuallyMerged {
        commit: Sha,
    },
    Closed,
    AutoMergeScheduled {
        style: MergeStyle,
    },
    DeletedBranch {
        branch: String,
    },
}
