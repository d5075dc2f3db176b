//! # Approval Policy
//!
//! Maps `(step.approve, plan summary, release-bump magnitude)` onto an
//! approval decision. `never` auto-approves only when there is nothing to
//! destroy; with destroys in the plan the step is refused rather than left
//! waiting.

use crate::model::ApprovePolicy;
use crate::provider::PlanSummary;
use semver::Version;

/// How far a release moves a step past its currently applied version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseBump {
    /// Nothing applied yet.
    Fresh,
    Patch,
    Minor,
    Major,
}

pub fn bump_between(applied: Option<&Version>, next: &Version) -> ReleaseBump {
    let Some(applied) = applied else {
        return ReleaseBump::Fresh;
    };
    if next.major != applied.major {
        ReleaseBump::Major
    } else if next.minor != applied.minor {
        ReleaseBump::Minor
    } else {
        ReleaseBump::Patch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Auto,
    Manual,
    Refuse(String),
}

pub fn decide(
    policy: ApprovePolicy,
    summary: &PlanSummary,
    bump: ReleaseBump,
) -> ApprovalDecision {
    match policy {
        ApprovePolicy::Never => {
            if summary.destroyed > 0 {
                ApprovalDecision::Refuse(format!(
                    "plan would destroy {} resource(s) but the step is set to approve=never",
                    summary.destroyed
                ))
            } else {
                ApprovalDecision::Auto
            }
        }
        ApprovePolicy::Minor => {
            let small_bump = matches!(
                bump,
                ReleaseBump::Fresh | ReleaseBump::Patch | ReleaseBump::Minor
            );
            if small_bump && summary.destroyed == 0 {
                ApprovalDecision::Auto
            } else {
                ApprovalDecision::Manual
            }
        }
        ApprovePolicy::Major => {
            if bump == ReleaseBump::Major {
                ApprovalDecision::Manual
            } else {
                ApprovalDecision::Auto
            }
        }
        ApprovePolicy::Always => ApprovalDecision::Manual,
    }
}

/// Destroy flows run under an explicit `delete` request; destroying is the
/// point, so only policies that ask for a human get one.
pub fn decide_destroy(policy: ApprovePolicy, summary: &PlanSummary) -> ApprovalDecision {
    match policy {
        ApprovePolicy::Never | ApprovePolicy::Major => ApprovalDecision::Auto,
        ApprovePolicy::Minor => {
            if summary.destroyed > 0 {
                ApprovalDecision::Manual
            } else {
                ApprovalDecision::Auto
            }
        }
        ApprovePolicy::Always => ApprovalDecision::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(added: u32, changed: u32, destroyed: u32) -> PlanSummary {
        PlanSummary {
            added,
            changed,
            destroyed,
            imported: 0,
        }
    }

    #[test]
    fn bump_magnitude() {
        let v = |a, b, c| Version::new(a, b, c);
        assert_eq!(bump_between(None, &v(1, 2, 0)), ReleaseBump::Fresh);
        assert_eq!(
            bump_between(Some(&v(1, 1, 0)), &v(1, 1, 3)),
            ReleaseBump::Patch
        );
        assert_eq!(
            bump_between(Some(&v(1, 1, 0)), &v(1, 2, 0)),
            ReleaseBump::Minor
        );
        assert_eq!(
            bump_between(Some(&v(1, 9, 0)), &v(2, 0, 0)),
            ReleaseBump::Major
        );
    }

    #[test]
    fn never_refuses_destroys_and_approves_the_rest() {
        assert_eq!(
            decide(ApprovePolicy::Never, &summary(3, 1, 0), ReleaseBump::Major),
            ApprovalDecision::Auto
        );
        assert!(matches!(
            decide(ApprovePolicy::Never, &summary(0, 0, 1), ReleaseBump::Patch),
            ApprovalDecision::Refuse(_)
        ));
    }

    #[test]
    fn minor_wants_a_human_for_destroys_and_major_bumps() {
        assert_eq!(
            decide(ApprovePolicy::Minor, &summary(5, 0, 0), ReleaseBump::Minor),
            ApprovalDecision::Auto
        );
        assert_eq!(
            decide(ApprovePolicy::Minor, &summary(5, 0, 2), ReleaseBump::Minor),
            ApprovalDecision::Manual
        );
        assert_eq!(
            decide(ApprovePolicy::Minor, &summary(1, 0, 0), ReleaseBump::Major),
            ApprovalDecision::Manual
        );
        assert_eq!(
            decide(ApprovePolicy::Minor, &summary(1, 0, 0), ReleaseBump::Fresh),
            ApprovalDecision::Auto
        );
    }

    #[test]
    fn major_only_gates_major_bumps() {
        assert_eq!(
            decide(ApprovePolicy::Major, &summary(0, 0, 3), ReleaseBump::Minor),
            ApprovalDecision::Auto
        );
        assert_eq!(
            decide(ApprovePolicy::Major, &summary(1, 0, 0), ReleaseBump::Major),
            ApprovalDecision::Manual
        );
    }

    #[test]
    fn always_always_waits() {
        assert_eq!(
            decide(ApprovePolicy::Always, &summary(0, 0, 0), ReleaseBump::Patch),
            ApprovalDecision::Manual
        );
    }

    #[test]
    fn destroy_flow_only_gates_minor_and_always() {
        assert_eq!(
            decide_destroy(ApprovePolicy::Never, &summary(0, 0, 9)),
            ApprovalDecision::Auto
        );
        assert_eq!(
            decide_destroy(ApprovePolicy::Minor, &summary(0, 0, 9)),
            ApprovalDecision::Manual
        );
        assert_eq!(
            decide_destroy(ApprovePolicy::Always, &summary(0, 0, 0)),
            ApprovalDecision::Manual
        );
    }
}
