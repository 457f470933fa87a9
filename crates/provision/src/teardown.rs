//! Teardown policy
//!
//! Decides, from the test outcome and the state of the test's context,
//! whether logs are collected and whether the infrastructure is destroyed.
//!
//! | context   | destroy_on_failure | logs                               | destroy                    |
//! |-----------|--------------------|------------------------------------|----------------------------|
//! | ended     | false              | no                                 | no, context error returned |
//! | ended     | true               | no                                 | yes, fresh context         |
//! | live      | any                | failed or always_collect_logs      | per destroy gate           |
//!
//! The destroy gate: destroy after a pass if `destroy_on_success`, after a
//! failure if `destroy_on_failure`. An ended context counts as a failure.

use testbed_common::{Interruption, ProvisionerPolicy};

/// What teardown is going to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownPlan {
    pub collect_logs: bool,
    pub destroy: bool,
    /// Destroy under a fresh finalization context instead of the test's own
    pub fresh_context: bool,
    /// Teardown skipped because the run was aborted; this is its result
    pub aborted: Option<Interruption>,
}

impl TeardownPlan {
    /// Human readable reason for skipping destroy, if it is skipped
    pub fn skip_reason(&self) -> Option<&'static str> {
        match (self.destroy, self.aborted) {
            (true, _) => None,
            (false, Some(_)) => Some("run aborted, leaving resources for inspection"),
            (false, None) => Some("not destroying per policy"),
        }
    }
}

/// Teardown decision rules
pub struct TeardownPolicy;

impl TeardownPolicy {
    pub fn decide(
        test_failed: bool,
        ctx_err: Option<Interruption>,
        policy: &ProvisionerPolicy,
    ) -> TeardownPlan {
        if let Some(cause) = ctx_err {
            if !policy.destroy_on_failure {
                return TeardownPlan {
                    collect_logs: false,
                    destroy: false,
                    fresh_context: false,
                    aborted: Some(cause),
                };
            }
            // nodes are unreliable after an interrupt, so no log collection
            return TeardownPlan {
                collect_logs: false,
                destroy: true,
                fresh_context: true,
                aborted: None,
            };
        }

        let destroy = if test_failed {
            policy.destroy_on_failure
        } else {
            policy.destroy_on_success
        };

        TeardownPlan {
            collect_logs: test_failed || policy.always_collect_logs,
            destroy,
            fresh_context: false,
            aborted: None,
        }
    }
}
