//! Provisioning with bounded retries
//!
//! Every attempt runs under its own deadline, taken in order from
//! [`RetryPolicy::attempt_timeouts`]. A timed out or failed attempt is
//! retried with the next deadline. When the caller's context ends during an
//! attempt there is no retry: the partially created infrastructure is
//! destroyed under a detached finalization context and the run fails.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use testbed_common::{Error, Interruption, Node, Result, RetrySettings};

use crate::context::RunContext;
use crate::ledger::ResourceLedger;
use crate::provisioner::Provisioner;

/// Attempt deadlines and cleanup budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// One entry per attempt, in order
    pub attempt_timeouts: Vec<Duration>,
    /// Budget for destroying leftovers once the run is over
    pub finalize_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeouts: vec![Duration::from_secs(15 * 60), Duration::from_secs(10 * 60)],
            finalize_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            attempt_timeouts: settings.attempt_timeouts(),
            finalize_timeout: settings.finalize_timeout(),
        }
    }
}

/// Successfully created and registered infrastructure
pub struct Provisioned {
    pub nodes: Vec<Node>,
    pub provisioner: Arc<dyn Provisioner>,
    pub tag: String,
}

/// Drives a provisioner's create through the retry policy
pub struct ProvisionRunner {
    retry: RetryPolicy,
    ledger: ResourceLedger,
}

impl ProvisionRunner {
    pub fn new(retry: RetryPolicy, ledger: ResourceLedger) -> Self {
        Self { retry, ledger }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create infrastructure and register `tag` in the ledger
    ///
    /// On any failure the provisioner's destroy has been attempted before
    /// this returns, and its error (if any) is aggregated into the result.
    pub async fn create(
        &self,
        ctx: &RunContext,
        provisioner: Arc<dyn Provisioner>,
        tag: &str,
    ) -> Result<Provisioned> {
        if self.retry.attempt_timeouts.is_empty() {
            return Err(Error::InvalidConfig(
                "retry policy needs at least one attempt".to_string(),
            ));
        }

        let kind = provisioner.kind();
        let attempts = self.retry.attempt_timeouts.len();
        let mut last_err = None;

        for (n, threshold) in self.retry.attempt_timeouts.iter().copied().enumerate() {
            let attempt = ctx.with_timeout(threshold);
            info!(
                provisioner = %kind,
                tag,
                attempt = n + 1,
                attempts,
                timeout_secs = threshold.as_secs(),
                "provisioning"
            );

            let result = provisioner.create(&attempt).await;

            if let Some(cause) = ctx.err() {
                error!(provisioner = %kind, tag, %cause, "provisioning interrupted by caller");
                let interrupted = Error::OuterInterrupted {
                    operation: format!("{} create", kind),
                    cause,
                    attempt: result.err().map(Box::new),
                };
                let cleanup = RunContext::detached(self.retry.finalize_timeout);
                let destroy_err = self.cleanup(&cleanup, provisioner.as_ref()).await;
                return Err(Error::aggregate([Some(interrupted), destroy_err])
                    .unwrap_or(Error::Interrupted {
                        operation: format!("{} create", kind),
                        cause,
                    }));
            }

            match result {
                Ok(nodes) => return self.register(provisioner, tag, nodes).await,
                Err(err) => {
                    let err = if attempt.err() == Some(Interruption::DeadlineExceeded) {
                        Error::AttemptTimeout(threshold)
                    } else {
                        err
                    };
                    warn!(
                        provisioner = %kind,
                        tag,
                        attempt = n + 1,
                        error = %err,
                        "provisioning attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        error!(provisioner = %kind, tag, attempts, "provisioning attempts exhausted");
        let cleanup = if ctx.is_done() {
            RunContext::detached(self.retry.finalize_timeout)
        } else {
            ctx.clone()
        };
        let destroy_err = self.cleanup(&cleanup, provisioner.as_ref()).await;
        Err(Error::aggregate([last_err, destroy_err]).unwrap_or(Error::InvalidState(
            "provisioning failed without an error".to_string(),
        )))
    }

    async fn register(
        &self,
        provisioner: Arc<dyn Provisioner>,
        tag: &str,
        nodes: Vec<Node>,
    ) -> Result<Provisioned> {
        if let Err(err) = self.ledger.allocate(tag) {
            error!(tag, error = %err, "failed to register resources, destroying them");
            let cleanup = RunContext::detached(self.retry.finalize_timeout);
            let destroy_err = self.cleanup(&cleanup, provisioner.as_ref()).await;
            return Err(Error::aggregate([Some(err), destroy_err])
                .unwrap_or(Error::DuplicateTag(tag.to_string())));
        }

        info!(tag, nodes = nodes.len(), "provisioned");
        Ok(Provisioned {
            nodes,
            provisioner,
            tag: tag.to_string(),
        })
    }

    async fn cleanup(&self, ctx: &RunContext, provisioner: &dyn Provisioner) -> Option<Error> {
        match provisioner.destroy(ctx).await {
            Ok(()) => None,
            Err(err) => {
                error!(provisioner = %provisioner.kind(), error = %err, "cleanup destroy failed");
                Some(Error::DestroyFailure(Box::new(err)))
            }
        }
    }
}
