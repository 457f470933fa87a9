mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Create, FakeProvisioner, RecordingCollector};
use tempfile::TempDir;
use testbed_common::{Error, Interruption, ProvisionerPolicy, TestStatus};
use testbed_provision::{
    Harness, LifecycleCoordinator, ResourceLedger, RetryPolicy, RunContext,
};

fn policy(on_success: bool, on_failure: bool, always_logs: bool) -> Arc<ProvisionerPolicy> {
    Arc::new(ProvisionerPolicy {
        destroy_on_success: on_success,
        destroy_on_failure: on_failure,
        always_collect_logs: always_logs,
        resource_list_file: None,
    })
}

fn retry(millis: &[u64]) -> RetryPolicy {
    RetryPolicy {
        attempt_timeouts: millis.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        finalize_timeout: Duration::from_secs(5),
    }
}

fn coordinator(
    ctx: &RunContext,
    policy: Arc<ProvisionerPolicy>,
    ledger: &ResourceLedger,
    collector: &Arc<RecordingCollector>,
) -> LifecycleCoordinator {
    LifecycleCoordinator::new(
        "install",
        ctx.clone(),
        policy,
        ledger.clone(),
        collector.clone(),
        retry(&[2000, 1000]),
    )
}

#[tokio::test]
async fn passed_test_destroys_once_and_releases_tag() {
    let tmp = TempDir::new().unwrap();
    let ledger = ResourceLedger::open(tmp.path().join("resources.txt")).unwrap();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(3)]);
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, true, false), &ledger, &collector);
    let (nodes, destroy) = coord.provision(fake.clone(), "e2e-pass").await.unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(ledger.contains("e2e-pass"));

    let report = destroy.run(false).await.unwrap();
    assert_eq!(report.status, TestStatus::Ok);
    assert!(report.destroyed);
    assert!(report.released);
    assert!(!report.collected_logs);

    assert_eq!(fake.destroy_count(), 1);
    assert_eq!(collector.count(), 0);
    assert!(!ledger.contains("e2e-pass"));
    assert!(ResourceLedger::read_file(tmp.path().join("resources.txt"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_test_collects_logs_once() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(2)]);
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, false, false), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-fail").await.unwrap();

    let report = destroy.run(true).await.unwrap();
    assert_eq!(report.status, TestStatus::Failed);
    assert!(report.collected_logs);
    assert!(!report.destroyed);
    assert!(report.skipped_reason.is_some());

    assert_eq!(*collector.calls.lock(), vec![("install".to_string(), 2)]);
    assert_eq!(fake.destroy_count(), 0);
    // kept for inspection, so still accounted for
    assert!(ledger.contains("e2e-fail"));
}

#[tokio::test]
async fn log_collection_failure_does_not_stop_destroy() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::failing());
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, true, true), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-logs").await.unwrap();

    let report = destroy.run(false).await.unwrap();
    assert!(!report.collected_logs);
    assert!(report.log_error.unwrap().contains("connection refused"));
    assert!(report.destroyed);
    assert_eq!(fake.destroy_count(), 1);
}

#[tokio::test]
async fn aborted_run_without_destroy_on_failure_skips_everything() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, false, true), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-abort").await.unwrap();

    ctx.cancel();
    let err = destroy.run(false).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Interrupted {
            cause: Interruption::Cancelled,
            ..
        }
    ));
    assert_eq!(collector.count(), 0);
    assert_eq!(fake.destroy_count(), 0);
    assert!(ledger.contains("e2e-abort"));
}

#[tokio::test]
async fn aborted_run_destroys_on_fresh_context() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(false, true, true), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-fresh").await.unwrap();

    ctx.cancel();
    let report = destroy.run(false).await.unwrap();
    assert!(report.destroyed);
    assert_eq!(report.status, TestStatus::Failed);
    assert_eq!(collector.count(), 0);

    let destroys = fake.destroys.lock();
    assert_eq!(destroys.len(), 1);
    assert!(!destroys[0].is_derived_from(&ctx));
    assert!(!destroys[0].is_done());
    assert!(!ledger.contains("e2e-fresh"));
}

#[tokio::test]
async fn deadline_during_log_collection_destroys_on_fresh_context() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::slow(Duration::from_millis(300)));
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let ctx = RunContext::background().with_timeout(Duration::from_millis(200));

    let coord = coordinator(&ctx, policy(false, true, false), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-slow-logs").await.unwrap();

    let report = destroy.run(true).await.unwrap();
    assert!(ctx.is_done());
    assert!(report.collected_logs);
    assert!(report.destroyed);
    assert_eq!(collector.count(), 1);

    let destroys = fake.destroys.lock();
    assert_eq!(destroys.len(), 1);
    assert!(!destroys[0].is_done());
    assert!(!destroys[0].is_derived_from(&ctx));
    assert!(!ledger.contains("e2e-slow-logs"));
}

#[tokio::test]
async fn destroy_failure_keeps_tag_registered() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]).failing_destroy();
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, true, false), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-stuck").await.unwrap();

    let err = destroy.run(false).await.unwrap_err();
    assert!(matches!(err, Error::DestroyFailure(_)));
    assert!(err.to_string().contains("resources still in use"));
    assert!(ledger.contains("e2e-stuck"));
}

#[tokio::test]
async fn panicking_destroy_is_reported() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]).panicking_destroy();
    let ctx = RunContext::background();

    let coord = coordinator(&ctx, policy(true, true, false), &ledger, &collector);
    let (_, destroy) = coord.provision(fake.clone(), "e2e-panic").await.unwrap();

    match destroy.run(false).await {
        Err(Error::Panicked { context, message }) => {
            assert!(context.contains("e2e-panic"));
            assert_eq!(message, "destroy exploded");
        }
        other => panic!("unexpected teardown result: {other:?}"),
    }
    assert!(ledger.contains("e2e-panic"));
}

#[tokio::test]
async fn retries_until_success_and_registers_once() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![
        Create::Fail("quota exceeded"),
        Create::Fail("quota exceeded"),
        Create::Nodes(3),
    ]);
    let ctx = RunContext::background();

    let coord = LifecycleCoordinator::new(
        "retry",
        ctx.clone(),
        policy(true, true, false),
        ledger.clone(),
        collector.clone(),
        retry(&[3000, 2000, 1000]),
    );
    let (nodes, destroy) = coord.provision(fake.clone(), "e2e-retry").await.unwrap();

    assert_eq!(nodes.len(), 3);
    assert_eq!(fake.create_count(), 3);
    assert_eq!(ledger.tags(), vec!["e2e-retry".to_string()]);
    assert_eq!(fake.destroy_count(), 0);

    destroy.run(false).await.unwrap();
}

#[tokio::test]
async fn outer_cancellation_aggregates_interruption_and_destroy_failure() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let fake = FakeProvisioner::new(vec![Create::Hang]).failing_destroy();
    let ctx = RunContext::background();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let coord = LifecycleCoordinator::new(
        "cancel",
        ctx.clone(),
        policy(true, true, false),
        ledger.clone(),
        collector.clone(),
        retry(&[10_000, 10_000]),
    );
    let err = match coord.provision(fake.clone(), "e2e-cancel").await {
        Err(err) => err,
        Ok(_) => panic!("provisioning should fail"),
    };

    let errors = err.errors();
    assert_eq!(errors.len(), 2);
    assert!(matches!(
        errors[0],
        Error::OuterInterrupted {
            cause: Interruption::Cancelled,
            ..
        }
    ));
    assert!(matches!(errors[1], Error::DestroyFailure(_)));

    assert_eq!(fake.create_count(), 1);
    let destroys = fake.destroys.lock();
    assert_eq!(destroys.len(), 1);
    assert_ne!(destroys[0].id(), ctx.id());
    assert!(!destroys[0].is_derived_from(&ctx));
    assert!(ledger.tags().is_empty());
}

#[tokio::test]
async fn harness_records_panicking_body_and_tears_down() {
    let tmp = TempDir::new().unwrap();
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let harness = Harness::new(
        RunContext::background(),
        ProvisionerPolicy::default(),
        ledger.clone(),
        collector.clone(),
        retry(&[1000]),
    )
    .with_report_dir(tmp.path());

    let ok = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let passed = harness
        .run_case("smoke", ok.clone(), "e2e-smoke", |nodes, _ctx| async move {
            assert_eq!(nodes.len(), 1);
            Ok::<(), Error>(())
        })
        .await;
    assert!(passed.success);
    assert!(passed.teardown.as_ref().unwrap().destroyed);

    let bad = FakeProvisioner::new(vec![Create::Nodes(2)]);
    let failed = harness
        .run_case("boom", bad.clone(), "e2e-boom", |_nodes, _ctx| async move {
            if true {
                panic!("assertion in test body");
            }
            Ok::<(), Error>(())
        })
        .await;
    assert!(!failed.success);
    assert!(failed.error.as_deref().unwrap().contains("assertion in test body"));
    let teardown = failed.teardown.as_ref().unwrap();
    assert!(teardown.collected_logs);
    assert!(teardown.destroyed);
    assert_eq!(bad.destroy_count(), 1);
    assert!(ledger.tags().is_empty());

    let suite = harness
        .finish(vec![passed, failed], Duration::from_millis(10))
        .unwrap();
    assert_eq!((suite.passed, suite.failed), (1, 1));
    assert!(tmp.path().join("test-results.json").exists());
}

#[tokio::test]
async fn harness_times_out_hanging_body() {
    let ledger = ResourceLedger::in_memory();
    let collector = Arc::new(RecordingCollector::default());
    let harness = Harness::new(
        RunContext::background(),
        ProvisionerPolicy::default(),
        ledger.clone(),
        collector.clone(),
        retry(&[1000]),
    )
    .with_test_timeout(Duration::from_millis(200));

    let fake = FakeProvisioner::new(vec![Create::Nodes(1)]);
    let result = harness
        .run_case("hang", fake.clone(), "e2e-hang", |_nodes, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), Error>(())
        })
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("deadline exceeded"));
    // destroy_on_failure is on, so teardown got its own context
    assert!(result.teardown.as_ref().unwrap().destroyed);
    assert_eq!(fake.destroy_count(), 1);
    assert!(ledger.tags().is_empty());
}
