//! testbed provisioning
//!
//! This crate owns the lifecycle of the infrastructure a test runs on:
//! - Creates nodes through Terraform or Vagrant with bounded retries
//! - Records every live allocation in a shared resource ledger
//! - Collects diagnostics and destroys nodes according to policy
//! - Survives cancellation: cleanup always runs on a live context
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Harness::run_case(name, provisioner, body)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LifecycleCoordinator (one per test)                        │
//! │    ├── provision(provisioner, tag) -> (nodes, DestroyFn)    │
//! │    │     └── ProvisionRunner                                │
//! │    │           ├── attempt 1 .. n, each with own deadline   │
//! │    │           ├── ResourceLedger::allocate(tag)            │
//! │    │           └── destroy on failure (detached context)    │
//! │    └── DestroyFn::run(test_failed)                          │
//! │          ├── TeardownPolicy::decide(...)                    │
//! │          ├── LogCollector::collect_logs(...)                │
//! │          ├── Provisioner::destroy(ctx)                      │
//! │          └── ResourceLedger::deallocate(tag)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Provisioner (trait)                                        │
//! │    ├── TerraformProvisioner  (terraform init/apply/destroy) │
//! │    └── VagrantProvisioner    (vagrant up/destroy)           │
//! │          └── run_tool(ctx, cmd): SIGINT, grace, SIGKILL     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod collect;
pub mod context;
pub mod harness;
pub mod ledger;
pub mod lifecycle;
pub mod process;
pub mod provisioner;
pub mod runner;
pub mod state;
pub mod teardown;

pub use collect::{CommandLogCollector, LogCollector, NoopLogCollector};
pub use context::RunContext;
pub use harness::{Harness, TestResult, TestSuiteResult};
pub use ledger::ResourceLedger;
pub use lifecycle::{DestroyFn, LifecycleCoordinator, TeardownReport};
pub use process::{run_tool, ToolCommand, ToolOutput};
pub use provisioner::{provisioner_from_config, provisioner_from_state, Provisioner, ProvisionerState};
pub use runner::{ProvisionRunner, Provisioned, RetryPolicy};
pub use state::TestState;
pub use teardown::{TeardownPlan, TeardownPolicy};
