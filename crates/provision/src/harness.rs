//! Test case harness
//!
//! Runs test bodies against freshly provisioned clusters and records the
//! outcome of each case, teardown included.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use testbed_common::{Node, ProvisionerPolicy, Result, TestbedConfig};

use crate::collect::{CommandLogCollector, LogCollector};
use crate::context::RunContext;
use crate::ledger::ResourceLedger;
use crate::lifecycle::{panic_message, LifecycleCoordinator, TeardownReport};
use crate::provisioner::Provisioner;
use crate::runner::RetryPolicy;

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub teardown: Option<TeardownReport>,
    pub teardown_error: Option<String>,
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn from_results(results: Vec<TestResult>, duration: Duration) -> Self {
        let passed = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            duration_ms: duration.as_millis() as u64,
            results,
        }
    }

    /// Write results as `test-results.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("test-results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Shared pieces every test case runs with
pub struct Harness {
    root: RunContext,
    policy: Arc<ProvisionerPolicy>,
    ledger: ResourceLedger,
    collector: Arc<dyn LogCollector>,
    retry: RetryPolicy,
    test_timeout: Duration,
    report_dir: PathBuf,
}

impl Harness {
    /// Build a harness from configuration, opening the configured ledger
    pub fn from_config(config: &TestbedConfig, root: RunContext) -> Result<Self> {
        Ok(Self {
            root,
            policy: Arc::new(config.policy.clone()),
            ledger: ResourceLedger::from_policy(&config.policy)?,
            collector: Arc::new(CommandLogCollector::from_config(config)),
            retry: RetryPolicy::from(&config.retry),
            test_timeout: config.test_timeout(),
            report_dir: config.report_dir.clone(),
        })
    }

    pub fn new(
        root: RunContext,
        policy: ProvisionerPolicy,
        ledger: ResourceLedger,
        collector: Arc<dyn LogCollector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            root,
            policy: Arc::new(policy),
            ledger,
            collector,
            retry,
            test_timeout: Duration::from_secs(3600),
            report_dir: PathBuf::from("reports"),
        }
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Provision, run `body` against the nodes, then tear down
    ///
    /// A body that errors, panics or outlives the test timeout fails the
    /// case. Teardown runs in every case where provisioning succeeded.
    pub async fn run_case<F, Fut>(
        &self,
        name: &str,
        provisioner: Arc<dyn Provisioner>,
        tag: &str,
        body: F,
    ) -> TestResult
    where
        F: FnOnce(Vec<Node>, RunContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let start = Instant::now();
        let ctx = self.root.with_timeout(self.test_timeout);
        let coordinator = LifecycleCoordinator::new(
            name,
            ctx.clone(),
            self.policy.clone(),
            self.ledger.clone(),
            self.collector.clone(),
            self.retry.clone(),
        );

        debug!("Running test: {}", name);
        let (nodes, destroy) = match coordinator.provision(provisioner, tag).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                error!("✗ {} - provisioning: {}", name, e);
                return TestResult {
                    name: name.to_string(),
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    teardown: None,
                    teardown_error: None,
                };
            }
        };

        let outcome = AssertUnwindSafe(ctx.run(body(nodes, ctx.clone())))
            .catch_unwind()
            .await;
        let test_error = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(cause)) => Some(format!("test body interrupted: {}", cause)),
            Err(panic) => Some(format!("test body panicked: {}", panic_message(panic.as_ref()))),
        };

        let (teardown, teardown_error) = match destroy.run(test_error.is_some()).await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                error!("{}: teardown failed: {}", name, e);
                (None, Some(e.to_string()))
            }
        };

        let result = TestResult {
            name: name.to_string(),
            success: test_error.is_none(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: test_error,
            teardown,
            teardown_error,
        };

        if result.success {
            info!("✓ {} ({} ms)", result.name, result.duration_ms);
        } else {
            error!(
                "✗ {} - {}",
                result.name,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    /// Summarize finished cases and write them to the report directory
    pub fn finish(&self, results: Vec<TestResult>, duration: Duration) -> Result<TestSuiteResult> {
        let suite = TestSuiteResult::from_results(results, duration);
        info!(
            "Test Results: {} passed, {} failed ({} ms)",
            suite.passed, suite.failed, suite.duration_ms
        );
        suite.write(&self.report_dir)?;
        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(name: &str, success: bool) -> TestResult {
        TestResult {
            name: name.to_string(),
            success,
            duration_ms: 1,
            error: (!success).then(|| "failed".to_string()),
            teardown: None,
            teardown_error: None,
        }
    }

    #[test]
    fn test_suite_counts_and_write() {
        let tmp = TempDir::new().unwrap();
        let suite = TestSuiteResult::from_results(
            vec![result("a", true), result("b", false), result("c", true)],
            Duration::from_millis(30),
        );
        assert_eq!((suite.total, suite.passed, suite.failed), (3, 2, 1));

        let path = suite.write(&tmp.path().join("out")).unwrap();
        let written: TestSuiteResult =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.results.len(), 3);
        assert_eq!(written.duration_ms, 30);
    }
}
