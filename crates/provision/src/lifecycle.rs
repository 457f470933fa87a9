//! Per-test lifecycle coordination
//!
//! A [`LifecycleCoordinator`] provisions infrastructure for one test and
//! hands back a [`DestroyFn`]. The test must call [`DestroyFn::run`] when it
//! is over; teardown then follows [`TeardownPolicy`].

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use testbed_common::{Error, Node, ProvisionerPolicy, Result, TestStatus};

use crate::collect::LogCollector;
use crate::context::RunContext;
use crate::ledger::ResourceLedger;
use crate::provisioner::Provisioner;
use crate::runner::{ProvisionRunner, RetryPolicy};
use crate::teardown::TeardownPolicy;

/// What teardown did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub tag: String,
    pub status: TestStatus,
    pub collected_logs: bool,
    pub log_error: Option<String>,
    pub destroyed: bool,
    /// Tag removed from the ledger
    pub released: bool,
    pub skipped_reason: Option<String>,
}

/// Provisions and tears down infrastructure for one test
pub struct LifecycleCoordinator {
    label: String,
    ctx: RunContext,
    policy: Arc<ProvisionerPolicy>,
    ledger: ResourceLedger,
    collector: Arc<dyn LogCollector>,
    retry: RetryPolicy,
}

impl LifecycleCoordinator {
    pub fn new(
        label: impl Into<String>,
        ctx: RunContext,
        policy: Arc<ProvisionerPolicy>,
        ledger: ResourceLedger,
        collector: Arc<dyn LogCollector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            label: label.into(),
            ctx,
            policy,
            ledger,
            collector,
            retry,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Create infrastructure and register `tag`
    ///
    /// Nothing is left behind on error: the runner has already tried to
    /// destroy whatever was created.
    pub async fn provision(
        &self,
        provisioner: Arc<dyn Provisioner>,
        tag: &str,
    ) -> Result<(Vec<Node>, DestroyFn)> {
        let runner = ProvisionRunner::new(self.retry.clone(), self.ledger.clone());
        let provisioned = runner.create(&self.ctx, provisioner, tag).await?;
        let destroy = self.destroy_fn(provisioned.provisioner, tag, provisioned.nodes.clone());
        Ok((provisioned.nodes, destroy))
    }

    /// Teardown handle for infrastructure registered under `tag`
    ///
    /// Also used to tear down infrastructure restored from a state file.
    pub fn destroy_fn(
        &self,
        provisioner: Arc<dyn Provisioner>,
        tag: &str,
        nodes: Vec<Node>,
    ) -> DestroyFn {
        DestroyFn {
            inner: Some(Teardown {
                label: self.label.clone(),
                tag: tag.to_string(),
                nodes,
                provisioner,
                ctx: self.ctx.clone(),
                policy: self.policy.clone(),
                ledger: self.ledger.clone(),
                collector: self.collector.clone(),
                finalize_timeout: self.retry.finalize_timeout,
            }),
        }
    }
}

/// One-shot teardown of a provisioned cluster
///
/// Dropping it without calling [`run`](Self::run) leaves the resources
/// registered in the ledger and logs an error.
#[must_use = "infrastructure leaks unless the destroy handle is run"]
pub struct DestroyFn {
    inner: Option<Teardown>,
}

impl DestroyFn {
    pub fn tag(&self) -> Option<&str> {
        self.inner.as_ref().map(|t| t.tag.as_str())
    }

    /// Tear down according to the policy
    ///
    /// A panic anywhere in teardown (log collection or destroy) is caught and
    /// returned as [`Error::Panicked`].
    pub async fn run(mut self, test_failed: bool) -> Result<TeardownReport> {
        let Some(teardown) = self.inner.take() else {
            return Err(Error::InvalidState("teardown already ran".to_string()));
        };
        let tag = teardown.tag.clone();

        match AssertUnwindSafe(teardown.execute(test_failed)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(tag, panic = %message, "panic during teardown");
                Err(Error::Panicked {
                    context: format!("teardown of {}", tag),
                    message,
                })
            }
        }
    }
}

impl Drop for DestroyFn {
    fn drop(&mut self) {
        if let Some(teardown) = &self.inner {
            error!(
                tag = %teardown.tag,
                label = %teardown.label,
                "destroy handle dropped without running, resources stay allocated"
            );
        }
    }
}

struct Teardown {
    label: String,
    tag: String,
    nodes: Vec<Node>,
    provisioner: Arc<dyn Provisioner>,
    ctx: RunContext,
    policy: Arc<ProvisionerPolicy>,
    ledger: ResourceLedger,
    collector: Arc<dyn LogCollector>,
    finalize_timeout: Duration,
}

impl Teardown {
    async fn execute(self, test_failed: bool) -> Result<TeardownReport> {
        let ctx_err = self.ctx.err();
        let plan = TeardownPolicy::decide(test_failed, ctx_err, &self.policy);
        let status = TestStatus::from_failed(test_failed || ctx_err.is_some());
        info!(
            label = %self.label,
            tag = %self.tag,
            %status,
            nodes = self.nodes.len(),
            collect_logs = plan.collect_logs,
            destroy = plan.destroy,
            "teardown"
        );

        if let Some(cause) = plan.aborted {
            warn!(tag = %self.tag, %cause, "run aborted, leaving resources in place");
            return Err(Error::Interrupted {
                operation: format!("test {}", self.label),
                cause,
            });
        }

        let mut report = TeardownReport {
            tag: self.tag.clone(),
            status,
            collected_logs: false,
            log_error: None,
            destroyed: false,
            released: false,
            skipped_reason: None,
        };

        let ctx = if plan.fresh_context {
            info!(tag = %self.tag, timeout = ?self.finalize_timeout, "allocating extra time for teardown");
            RunContext::detached(self.finalize_timeout)
        } else {
            self.ctx.clone()
        };

        if plan.collect_logs {
            match self.collector.collect_logs(&ctx, &self.label, &self.nodes).await {
                Ok(()) => report.collected_logs = true,
                Err(err) => {
                    error!(tag = %self.tag, error = %err, "failed to collect diagnostics");
                    report.log_error = Some(err.to_string());
                }
            }
        }

        if !plan.destroy {
            info!(tag = %self.tag, "not destroying VMs per policy");
            report.skipped_reason = plan.skip_reason().map(str::to_string);
            return Ok(report);
        }

        let ctx = match ctx.err() {
            Some(cause) => {
                warn!(
                    tag = %self.tag,
                    %cause,
                    timeout = ?self.finalize_timeout,
                    "context ended during teardown, destroying on a fresh one"
                );
                RunContext::detached(self.finalize_timeout)
            }
            None => ctx,
        };

        info!(tag = %self.tag, "destroying VMs");
        if let Err(err) = self.provisioner.destroy(&ctx).await {
            error!(tag = %self.tag, error = %err, "destroying VM resources");
            return Err(Error::DestroyFailure(Box::new(err)));
        }
        report.destroyed = true;

        self.ledger.deallocate(&self.tag)?;
        report.released = true;
        Ok(report)
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "plain");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "formatted 42");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "unknown panic");
    }
}
