//! Merge and update permission decisions.
//!
//! Combines repository permission, the first matching protection rule,
//! approvals and check status into allow/deny answers. Lookup failures from
//! collaborators are returned as [`PolicyError`], never treated as denial.

use thiserror::Error;

use crate::types::{Flow, Proposal, RepoId, Status, UserId};

use super::{AccessMode, CommitState, PolicyError, PolicyResult, ProtectionRule, Services};

/// Why a proposal may not be merged right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("user is not allowed to merge into this branch")]
    NotAllowed,

    #[error("proposal is marked as work in progress")]
    WorkInProgress,

    #[error("mergeability is still being checked, try again later")]
    StillChecking,

    #[error("proposal has merge conflicts")]
    HasConflicts,

    #[error("{have} of {need} required approvals")]
    MissingApprovals { have: u32, need: u32 },

    #[error("proposal changes protected files: {}", paths.join(", "))]
    ProtectedFiles { paths: Vec<String> },

    #[error("required status checks are {state}")]
    ChecksNotPassed { state: CommitState },

    #[error("head is {behind} commit(s) behind the base branch")]
    Outdated { behind: u64 },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// What an actor may do to bring a proposal's head up to date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatePermission {
    /// Merge the base into the head.
    pub merge: bool,
    /// Rebase the head onto the base (force push).
    pub rebase: bool,
}

/// Whether `actor` may merge into the proposal's base branch.
pub fn is_allowed_to_merge(
    services: &Services,
    proposal: &Proposal,
    actor: UserId,
) -> PolicyResult<bool> {
    let mode = services
        .permissions
        .access_mode(&proposal.base.repo, actor)?;
    allowed_to_merge_into(
        services,
        &proposal.base.repo,
        &proposal.base.branch,
        actor,
        mode,
    )
}

fn allowed_to_merge_into(
    services: &Services,
    repo: &RepoId,
    branch: &str,
    actor: UserId,
    mode: AccessMode,
) -> PolicyResult<bool> {
    if !mode.can_write() {
        return Ok(false);
    }
    let rule = services.protection.first_matching_rule(repo, branch)?;
    Ok(rule.is_none_or(|rule| rule.can_user_merge(actor, mode)))
}

/// Decides whether an open proposal can be merged by `actor` now.
///
/// With `force`, an admin the matching rule does not apply to may merge past
/// protection rejections (approvals, protected files, checks, outdated).
pub fn check_mergeable(
    services: &Services,
    proposal: &Proposal,
    actor: UserId,
    wip_prefixes: &[String],
    force: bool,
) -> Result<(), GateError> {
    let mode = services
        .permissions
        .access_mode(&proposal.base.repo, actor)?;
    if !allowed_to_merge_into(
        services,
        &proposal.base.repo,
        &proposal.base.branch,
        actor,
        mode,
    )? {
        return Err(Rejection::NotAllowed.into());
    }

    if proposal.is_work_in_progress(wip_prefixes) {
        return Err(Rejection::WorkInProgress.into());
    }

    match proposal.status {
        Status::Mergeable => {}
        Status::Conflict => return Err(Rejection::HasConflicts.into()),
        _ => return Err(Rejection::StillChecking.into()),
    }

    let Some(rule) = services
        .protection
        .first_matching_rule(&proposal.base.repo, &proposal.base.branch)?
    else {
        return Ok(());
    };

    match check_protection(services, proposal, &rule) {
        Err(GateError::Rejected(rejection))
            if force && mode.is_admin() && !rule.apply_to_admins =>
        {
            tracing::warn!(
                proposal = %proposal.id,
                actor = %actor,
                %rejection,
                "admin merging past branch protection"
            );
            Ok(())
        }
        other => other,
    }
}

fn check_protection(
    services: &Services,
    proposal: &Proposal,
    rule: &ProtectionRule,
) -> Result<(), GateError> {
    if rule.required_approvals > 0 {
        let have = services.reviews.approvals(proposal, rule)?;
        if have < rule.required_approvals {
            return Err(Rejection::MissingApprovals {
                have,
                need: rule.required_approvals,
            }
            .into());
        }
    }

    if !proposal.changed_protected_files.is_empty() {
        return Err(Rejection::ProtectedFiles {
            paths: proposal.changed_protected_files.clone(),
        }
        .into());
    }

    if rule.block_on_outdated_branch && proposal.divergence.behind > 0 {
        return Err(Rejection::Outdated {
            behind: proposal.divergence.behind,
        }
        .into());
    }

    if rule.require_status_checks {
        let state = match &proposal.head_commit {
            Some(commit) => services
                .statuses
                .combined_state(&proposal.base.repo, commit)?,
            None => CommitState::Pending,
        };
        if !state.is_success() {
            return Err(Rejection::ChecksNotPassed { state }.into());
        }
    }

    Ok(())
}

/// Whether `actor` may update the proposal's head from its base.
///
/// The update runs in the reverse direction (base into head), so the rule
/// that matters is the one protecting the head branch. Rebasing rewrites
/// history with a force push, so it is only offered when no rule governs
/// the head branch and the base repository enables rebase updates.
pub fn is_allowed_to_update(
    services: &Services,
    proposal: &Proposal,
    actor: UserId,
) -> PolicyResult<UpdatePermission> {
    if proposal.flow == Flow::DirectRef {
        return Ok(UpdatePermission::default());
    }

    let head_mode = services
        .permissions
        .access_mode(&proposal.head.repo, actor)?;
    let rule = services
        .protection
        .first_matching_rule(&proposal.head.repo, &proposal.head.branch)?;

    if let Some(rule) = &rule
        && !rule.can_user_push(actor, head_mode)
    {
        return Ok(UpdatePermission::default());
    }

    let mut merge = allowed_to_merge_into(
        services,
        &proposal.head.repo,
        &proposal.head.branch,
        actor,
        head_mode,
    )?;

    // Maintainer edits grant base-repository writers access to the head.
    if !merge && proposal.allow_maintainer_edit {
        let base_mode = services
            .permissions
            .access_mode(&proposal.base.repo, actor)?;
        merge = allowed_to_merge_into(
            services,
            &proposal.head.repo,
            &proposal.head.branch,
            actor,
            base_mode,
        )?;
    }

    let rebase =
        merge && rule.is_none() && services.protection.allow_rebase_update(&proposal.base.repo)?;

    Ok(UpdatePermission { merge, rebase })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::StaticPolicy;
    use crate::test_utils::{TestRepos, sample_proposal};
    use crate::types::{Endpoint, Sha};
    use std::sync::Arc;

    fn upstream() -> RepoId {
        TestRepos::repo_id("upstream")
    }

    fn services(policy: StaticPolicy) -> (Arc<StaticPolicy>, Services) {
        let policy = Arc::new(policy);
        let services = Services::uniform(policy.clone());
        (policy, services)
    }

    fn mergeable(id: u64) -> Proposal {
        let mut pr = sample_proposal(id, "feat", "main");
        pr.status = Status::Mergeable;
        pr.head_commit = Some(Sha::parse("b".repeat(40)).unwrap());
        pr
    }

    fn rejection(result: Result<(), GateError>) -> Rejection {
        match result {
            Err(GateError::Rejected(r)) => r,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn writer_without_rule_may_merge() {
        let (_, s) = services(StaticPolicy::new().with_grant(&upstream(), UserId(2), AccessMode::Write));
        let pr = mergeable(1);
        assert!(is_allowed_to_merge(&s, &pr, UserId(2)).unwrap());
        assert!(!is_allowed_to_merge(&s, &pr, UserId(3)).unwrap());
        check_mergeable(&s, &pr, UserId(2), &[], false).unwrap();
    }

    #[test]
    fn open_states_and_wip_are_rejected() {
        let (_, s) = services(StaticPolicy::new().with_grant(&upstream(), UserId(2), AccessMode::Write));
        let wip = vec!["WIP:".to_string()];

        let mut pr = mergeable(1);
        pr.title = "WIP: soon".to_string();
        assert_eq!(
            rejection(check_mergeable(&s, &pr, UserId(2), &wip, false)),
            Rejection::WorkInProgress
        );

        let mut pr = mergeable(1);
        pr.status = Status::Conflict;
        assert_eq!(
            rejection(check_mergeable(&s, &pr, UserId(2), &wip, false)),
            Rejection::HasConflicts
        );

        pr.status = Status::Checking;
        assert_eq!(
            rejection(check_mergeable(&s, &pr, UserId(2), &wip, false)),
            Rejection::StillChecking
        );
    }

    #[test]
    fn protection_rule_requirements() {
        let mut rule = ProtectionRule::new("main");
        rule.required_approvals = 2;
        rule.require_status_checks = true;
        let (policy, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(2), AccessMode::Write)
                .with_rule(&upstream(), rule),
        );
        let pr = mergeable(1);

        assert_eq!(
            rejection(check_mergeable(&s, &pr, UserId(2), &[], false)),
            Rejection::MissingApprovals { have: 0, need: 2 }
        );

        policy.set_approvals(pr.id, 2);
        assert_eq!(
            rejection(check_mergeable(&s, &pr, UserId(2), &[], false)),
            Rejection::ChecksNotPassed {
                state: CommitState::Pending
            }
        );

        policy.set_status(&upstream(), pr.head_commit.as_ref().unwrap(), CommitState::Success);
        check_mergeable(&s, &pr, UserId(2), &[], false).unwrap();

        let mut touches_protected = pr.clone();
        touches_protected.changed_protected_files = vec!["Cargo.lock".to_string()];
        assert!(matches!(
            rejection(check_mergeable(&s, &touches_protected, UserId(2), &[], false)),
            Rejection::ProtectedFiles { .. }
        ));
    }

    #[test]
    fn admin_force_skips_protection_unless_applied_to_admins() {
        let mut rule = ProtectionRule::new("main");
        rule.required_approvals = 1;
        let (_, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(2), AccessMode::Write)
                .with_grant(&upstream(), UserId(9), AccessMode::Admin)
                .with_rule(&upstream(), rule.clone()),
        );
        let pr = mergeable(1);

        check_mergeable(&s, &pr, UserId(9), &[], true).unwrap();
        assert!(check_mergeable(&s, &pr, UserId(9), &[], false).is_err());
        assert!(check_mergeable(&s, &pr, UserId(2), &[], true).is_err());

        rule.apply_to_admins = true;
        let (_, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(9), AccessMode::Admin)
                .with_rule(&upstream(), rule),
        );
        assert!(check_mergeable(&s, &pr, UserId(9), &[], true).is_err());
    }

    #[test]
    fn merge_allowlist_denies_other_writers() {
        let mut rule = ProtectionRule::new("main");
        rule.merge_allowlist = Some(vec![UserId(7)]);
        let (_, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(2), AccessMode::Write)
                .with_rule(&upstream(), rule),
        );
        assert_eq!(
            rejection(check_mergeable(&s, &mergeable(1), UserId(2), &[], false)),
            Rejection::NotAllowed
        );
    }

    #[test]
    fn rebase_update_only_without_head_rule() {
        let (_, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(2), AccessMode::Write)
                .with_rebase_update(&upstream()),
        );
        let pr = mergeable(1);
        assert_eq!(
            is_allowed_to_update(&s, &pr, UserId(2)).unwrap(),
            UpdatePermission {
                merge: true,
                rebase: true
            }
        );

        let (_, s) = services(
            StaticPolicy::new()
                .with_grant(&upstream(), UserId(2), AccessMode::Write)
                .with_rebase_update(&upstream())
                .with_rule(&upstream(), ProtectionRule::new("feat")),
        );
        assert_eq!(
            is_allowed_to_update(&s, &pr, UserId(2)).unwrap(),
            UpdatePermission {
                merge: true,
                rebase: false
            }
        );
    }

    #[test]
    fn maintainer_edit_grants_base_writers() {
        let fork = TestRepos::repo_id("fork");
        let (_, s) = services(
            StaticPolicy::new().with_grant(&upstream(), UserId(2), AccessMode::Write),
        );
        let mut pr = mergeable(1);
        pr.head = Endpoint::new(fork, "feat");

        assert_eq!(
            is_allowed_to_update(&s, &pr, UserId(2)).unwrap(),
            UpdatePermission::default()
        );

        pr.allow_maintainer_edit = true;
        assert!(is_allowed_to_update(&s, &pr, UserId(2)).unwrap().merge);
    }

    #[test]
    fn direct_ref_flow_cannot_be_updated() {
        let (_, s) = services(
            StaticPolicy::new().with_grant(&upstream(), UserId(2), AccessMode::Owner),
        );
        let mut pr = mergeable(1);
        pr.flow = Flow::DirectRef;
        assert_eq!(
            is_allowed_to_update(&s, &pr, UserId(2)).unwrap(),
            UpdatePermission::default()
        );
    }

    struct FailingPermissions;

    impl super::super::PermissionSource for FailingPermissions {
        fn access_mode(&self, _: &RepoId, _: UserId) -> PolicyResult<AccessMode> {
            Err(PolicyError::new("permissions", "backend unavailable"))
        }
    }

    #[test]
    fn lookup_failure_is_an_error_not_a_denial() {
        let (_, mut s) = services(StaticPolicy::new());
        s.permissions = Arc::new(FailingPermissions);
        let pr = mergeable(1);

        assert!(is_allowed_to_merge(&s, &pr, UserId(2)).is_err());
        assert!(matches!(
            check_mergeable(&s, &pr, UserId(2), &[], false),
            Err(GateError::Policy(_))
        ));
        assert!(is_allowed_to_update(&s, &pr, UserId(2)).is_err());
    }
}
