//! An in-process policy holding every collaborator fact.
//!
//! Loaded from a JSON file by the daemon; built with the `with_*` methods in
//! tests. Commit statuses can be updated at runtime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::types::{Proposal, ProposalId, RepoId, Sha, UserId};

use super::{
    AccessMode, AccountDirectory, CommitState, PermissionSource, PolicyError, PolicyResult,
    ProtectionRule, ProtectionSource, ReviewSource, StatusSource,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub repo: RepoId,
    pub user: UserId,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRule {
    pub repo: RepoId,
    #[serde(flatten)]
    pub rule: ProtectionRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The blocking user (a repository owner or a poster).
    pub blocker: UserId,
    pub blocked: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedStatus {
    pub repo: RepoId,
    pub commit: Sha,
    pub state: CommitState,
}

/// The serialized form of a [`StaticPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub rules: Vec<RepoRule>,
    #[serde(default)]
    pub rebase_update_repos: Vec<RepoId>,
    /// Repository owners, by owner name, for block lookups.
    #[serde(default)]
    pub owners: HashMap<String, UserId>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub approvals: HashMap<ProposalId, u32>,
    #[serde(default)]
    pub statuses: Vec<RecordedStatus>,
}

/// A [`PolicyFile`] behind a lock, implementing every collaborator trait.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    inner: RwLock<PolicyFile>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(file: PolicyFile) -> Self {
        StaticPolicy {
            inner: RwLock::new(file),
        }
    }

    /// Loads a policy from a JSON file.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let bytes = std::fs::read(path)?;
        let file: PolicyFile = serde_json::from_slice(&bytes)?;
        Ok(Self::from_file(file))
    }

    pub fn with_grant(self, repo: &RepoId, user: UserId, mode: AccessMode) -> Self {
        self.write(|p| {
            p.grants.retain(|g| !(g.repo == *repo && g.user == user));
            p.grants.push(Grant {
                repo: repo.clone(),
                user,
                mode,
            });
        });
        self
    }

    pub fn with_rule(self, repo: &RepoId, rule: ProtectionRule) -> Self {
        self.write(|p| {
            p.rules.push(RepoRule {
                repo: repo.clone(),
                rule,
            })
        });
        self
    }

    pub fn with_rebase_update(self, repo: &RepoId) -> Self {
        self.write(|p| p.rebase_update_repos.push(repo.clone()));
        self
    }

    pub fn with_account(self, id: UserId, email: &str) -> Self {
        self.write(|p| match p.accounts.iter_mut().find(|a| a.id == id) {
            Some(account) => account.emails.push(email.to_string()),
            None => p.accounts.push(Account {
                id,
                emails: vec![email.to_string()],
            }),
        });
        self
    }

    pub fn with_owner(self, owner: &str, id: UserId) -> Self {
        self.write(|p| {
            p.owners.insert(owner.to_string(), id);
        });
        self
    }

    pub fn with_block(self, blocker: UserId, blocked: UserId) -> Self {
        self.write(|p| p.blocks.push(Block { blocker, blocked }));
        self
    }

    pub fn set_approvals(&self, proposal: ProposalId, count: u32) {
        self.write(|p| {
            p.approvals.insert(proposal, count);
        });
    }

    /// Records the aggregate check state of a commit.
    pub fn set_status(&self, repo: &RepoId, commit: &Sha, state: CommitState) {
        self.write(|p| {
            p.statuses
                .retain(|s| !(s.repo == *repo && s.commit == *commit));
            p.statuses.push(RecordedStatus {
                repo: repo.clone(),
                commit: commit.clone(),
                state,
            });
        });
    }

    fn read<T>(&self, f: impl FnOnce(&PolicyFile) -> T) -> PolicyResult<T> {
        let guard = self
            .inner
            .read()
            .map_err(|_| PolicyError::new("policy", "lock poisoned"))?;
        Ok(f(&guard))
    }

    fn write(&self, f: impl FnOnce(&mut PolicyFile)) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard);
    }
}

impl PermissionSource for StaticPolicy {
    fn access_mode(&self, repo: &RepoId, user: UserId) -> PolicyResult<AccessMode> {
        self.read(|p| {
            if p.owners.get(&repo.owner) == Some(&user) {
                return AccessMode::Owner;
            }
            p.grants
                .iter()
                .find(|g| g.repo == *repo && g.user == user)
                .map_or(AccessMode::Read, |g| g.mode)
        })
    }
}

impl ProtectionSource for StaticPolicy {
    fn first_matching_rule(
        &self,
        repo: &RepoId,
        branch: &str,
    ) -> PolicyResult<Option<ProtectionRule>> {
        self.read(|p| {
            let matching: Vec<&ProtectionRule> = p
                .rules
                .iter()
                .filter(|r| r.repo == *repo && r.rule.matches(branch))
                .map(|r| &r.rule)
                .collect();
            // Exact names win over globs; globs in declaration order.
            matching
                .iter()
                .find(|r| r.is_exact())
                .or_else(|| matching.first())
                .map(|r| (*r).clone())
        })
    }

    fn allow_rebase_update(&self, repo: &RepoId) -> PolicyResult<bool> {
        self.read(|p| p.rebase_update_repos.contains(repo))
    }
}

impl ReviewSource for StaticPolicy {
    fn approvals(&self, proposal: &Proposal, _rule: &ProtectionRule) -> PolicyResult<u32> {
        self.read(|p| p.approvals.get(&proposal.id).copied().unwrap_or(0))
    }
}

impl StatusSource for StaticPolicy {
    fn combined_state(&self, repo: &RepoId, commit: &Sha) -> PolicyResult<CommitState> {
        self.read(|p| {
            p.statuses
                .iter()
                .find(|s| s.repo == *repo && s.commit == *commit)
                .map_or(CommitState::Pending, |s| s.state)
        })
    }
}

impl AccountDirectory for StaticPolicy {
    fn is_blocked(&self, repo: &RepoId, poster: UserId, actor: UserId) -> PolicyResult<bool> {
        self.read(|p| {
            let owner = p.owners.get(&repo.owner).copied();
            p.blocks.iter().any(|b| {
                b.blocked == actor && (b.blocker == poster || Some(b.blocker) == owner)
            })
        })
    }

    fn account_by_email(&self, email: &str) -> PolicyResult<Option<UserId>> {
        self.read(|p| {
            p.accounts
                .iter()
                .find(|a| a.emails.iter().any(|e| e.eq_ignore_ascii_case(email)))
                .map(|a| a.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoId {
        RepoId::new("acme", "upstream")
    }

    #[test]
    fn exact_rule_beats_earlier_glob() {
        let mut glob = ProtectionRule::new("*");
        glob.required_approvals = 1;
        let mut exact = ProtectionRule::new("main");
        exact.required_approvals = 2;

        let policy = StaticPolicy::new()
            .with_rule(&repo(), glob)
            .with_rule(&repo(), exact);

        let rule = policy.first_matching_rule(&repo(), "main").unwrap().unwrap();
        assert_eq!(rule.required_approvals, 2);
        let rule = policy.first_matching_rule(&repo(), "dev").unwrap().unwrap();
        assert_eq!(rule.required_approvals, 1);
        assert!(
            policy
                .first_matching_rule(&RepoId::new("acme", "other"), "main")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn owner_has_owner_access() {
        let policy = StaticPolicy::new()
            .with_owner("acme", UserId(9))
            .with_grant(&repo(), UserId(2), AccessMode::Write);

        assert_eq!(policy.access_mode(&repo(), UserId(9)).unwrap(), AccessMode::Owner);
        assert_eq!(policy.access_mode(&repo(), UserId(2)).unwrap(), AccessMode::Write);
        assert_eq!(policy.access_mode(&repo(), UserId(3)).unwrap(), AccessMode::Read);
    }

    #[test]
    fn blocks_by_owner_or_poster() {
        let policy = StaticPolicy::new()
            .with_owner("acme", UserId(9))
            .with_block(UserId(9), UserId(4))
            .with_block(UserId(1), UserId(5));

        assert!(policy.is_blocked(&repo(), UserId(1), UserId(4)).unwrap());
        assert!(policy.is_blocked(&repo(), UserId(1), UserId(5)).unwrap());
        assert!(!policy.is_blocked(&repo(), UserId(2), UserId(5)).unwrap());
    }

    #[test]
    fn policy_file_round_trips_through_json() {
        let json = r#"{
            "grants": [{"repo": {"owner": "acme", "repo": "upstream"}, "user": 2, "mode": "write"}],
            "rules": [{"repo": {"owner": "acme", "repo": "upstream"}, "branch_pattern": "main", "required_approvals": 1}],
            "accounts": [{"id": 1, "emails": ["poster@example.com"]}]
        }"#;
        let file: PolicyFile = serde_json::from_str(json).unwrap();
        let policy = StaticPolicy::from_file(file);

        assert_eq!(policy.access_mode(&repo(), UserId(2)).unwrap(), AccessMode::Write);
        assert_eq!(
            policy
                .first_matching_rule(&repo(), "main")
                .unwrap()
                .unwrap()
                .required_approvals,
            1
        );
        assert_eq!(
            policy.account_by_email("Poster@Example.com").unwrap(),
            Some(UserId(1))
        );
    }

    #[test]
    fn statuses_default_to_pending() {
        let policy = StaticPolicy::new();
        let sha = Sha::parse("a".repeat(40)).unwrap();
        assert_eq!(
            policy.combined_state(&repo(), &sha).unwrap(),
            CommitState::Pending
        );
        policy.set_status(&repo(), &sha, CommitState::Success);
        assert_eq!(
            policy.combined_state(&repo(), &sha).unwrap(),
            CommitState::Success
        );
    }
}
