//! Branch protection rules.

use glob_match::glob_match;
use serde::{Deserialize, Serialize};

use crate::types::UserId;

use super::AccessMode;

/// A protection rule for branches matching `branch_pattern`.
///
/// Patterns without glob characters match one branch exactly and take
/// precedence over glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub branch_pattern: String,

    #[serde(default)]
    pub required_approvals: u32,

    /// Glob patterns of paths that may not change through a proposal.
    #[serde(default)]
    pub protected_files: Vec<String>,

    /// Admins are held to the rule too; otherwise they may force past it.
    #[serde(default)]
    pub apply_to_admins: bool,

    /// Users allowed to push. `None` means anyone with write access.
    #[serde(default)]
    pub push_allowlist: Option<Vec<UserId>>,

    /// Users allowed to merge. `None` means anyone with write access.
    #[serde(default)]
    pub merge_allowlist: Option<Vec<UserId>>,

    /// Refuse merging proposals that are behind their base.
    #[serde(default)]
    pub block_on_outdated_branch: bool,

    /// Require the head commit's checks to have succeeded.
    #[serde(default)]
    pub require_status_checks: bool,
}

impl ProtectionRule {
    pub fn new(branch_pattern: impl Into<String>) -> Self {
        ProtectionRule {
            branch_pattern: branch_pattern.into(),
            required_approvals: 0,
            protected_files: Vec::new(),
            apply_to_admins: false,
            push_allowlist: None,
            merge_allowlist: None,
            block_on_outdated_branch: false,
            require_status_checks: false,
        }
    }

    /// True when the pattern names a single branch.
    pub fn is_exact(&self) -> bool {
        !self
            .branch_pattern
            .contains(['*', '?', '[', '{'])
    }

    pub fn matches(&self, branch: &str) -> bool {
        if self.is_exact() {
            self.branch_pattern == branch
        } else {
            glob_match(&self.branch_pattern, branch)
        }
    }

    /// Changed paths covered by the protected-file patterns (case-insensitive).
    pub fn protected_paths(&self, changed: &[String]) -> Vec<String> {
        if self.protected_files.is_empty() {
            return Vec::new();
        }
        let patterns: Vec<String> = self
            .protected_files
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        changed
            .iter()
            .filter(|path| {
                let lower = path.to_lowercase();
                patterns.iter().any(|p| glob_match(p, &lower))
            })
            .cloned()
            .collect()
    }

    pub fn can_user_push(&self, user: UserId, mode: AccessMode) -> bool {
        mode.can_write() && allowed(&self.push_allowlist, user)
    }

    pub fn can_user_merge(&self, user: UserId, mode: AccessMode) -> bool {
        mode.can_write() && allowed(&self.merge_allowlist, user)
    }
}

fn allowed(list: &Option<Vec<UserId>>, user: UserId) -> bool {
    list.as_ref().is_none_or(|users| users.contains(&user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_glob_matching() {
        let exact = ProtectionRule::new("main");
        assert!(exact.is_exact());
        assert!(exact.matches("main"));
        assert!(!exact.matches("main2"));

        let glob = ProtectionRule::new("release/*");
        assert!(!glob.is_exact());
        assert!(glob.matches("release/1.0"));
        assert!(!glob.matches("release/1.0/hotfix"));
        assert!(!glob.matches("main"));
    }

    #[test]
    fn protected_paths_are_case_insensitive_globs() {
        let mut rule = ProtectionRule::new("main");
        rule.protected_files = vec!["*.lock".to_string(), ".github/**".to_string()];

        let changed = vec![
            "Cargo.LOCK".to_string(),
            ".github/workflows/ci.yml".to_string(),
            "src/lib.rs".to_string(),
        ];
        assert_eq!(
            rule.protected_paths(&changed),
            vec![
                "Cargo.LOCK".to_string(),
                ".github/workflows/ci.yml".to_string()
            ]
        );
    }

    #[test]
    fn allowlists_require_write_access() {
        let mut rule = ProtectionRule::new("main");
        assert!(rule.can_user_merge(UserId(5), AccessMode::Write));
        assert!(!rule.can_user_merge(UserId(5), AccessMode::Read));

        rule.merge_allowlist = Some(vec![UserId(6)]);
        assert!(!rule.can_user_merge(UserId(5), AccessMode::Admin));
        assert!(rule.can_user_merge(UserId(6), AccessMode::Write));
        assert!(rule.can_user_push(UserId(5), AccessMode::Write));
    }
}
