//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testbed_common::{Error, Node, ProvisionerKind, Result};
use testbed_provision::{LogCollector, Provisioner, ProvisionerState, RunContext};

/// What the next `create` call does
pub enum Create {
    Nodes(usize),
    Fail(&'static str),
    /// Block until the attempt context ends
    Hang,
}

/// Provisioner with scripted outcomes that records every call
pub struct FakeProvisioner {
    script: Mutex<VecDeque<Create>>,
    destroy_fails: Mutex<bool>,
    destroy_panics: Mutex<bool>,
    pub creates: Mutex<Vec<RunContext>>,
    pub destroys: Mutex<Vec<RunContext>>,
}

impl FakeProvisioner {
    pub fn new(script: Vec<Create>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            destroy_fails: Mutex::new(false),
            destroy_panics: Mutex::new(false),
            creates: Mutex::new(Vec::new()),
            destroys: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_destroy(self: Arc<Self>) -> Arc<Self> {
        *self.destroy_fails.lock() = true;
        self
    }

    pub fn panicking_destroy(self: Arc<Self>) -> Arc<Self> {
        *self.destroy_panics.lock() = true;
        self
    }

    pub fn create_count(&self) -> usize {
        self.creates.lock().len()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.lock().len()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Vagrant
    }

    async fn create(&self, ctx: &RunContext) -> Result<Vec<Node>> {
        self.creates.lock().push(ctx.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(Create::Nodes(n)) => Ok((0..n)
                .map(|i| Node::new(format!("54.0.0.{}", i + 1), format!("10.0.0.{}", i + 1)))
                .collect()),
            Some(Create::Fail(msg)) => Err(Error::Tool {
                tool: "fake apply".to_string(),
                status: "exit status: 1".to_string(),
                stderr: msg.to_string(),
            }),
            Some(Create::Hang) | None => {
                let cause = ctx.done().await;
                Err(Error::Interrupted {
                    operation: "fake apply".to_string(),
                    cause,
                })
            }
        }
    }

    async fn destroy(&self, ctx: &RunContext) -> Result<()> {
        self.destroys.lock().push(ctx.clone());
        if *self.destroy_panics.lock() {
            panic!("destroy exploded");
        }
        if *self.destroy_fails.lock() {
            return Err(Error::Tool {
                tool: "fake destroy".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "resources still in use".to_string(),
            });
        }
        Ok(())
    }

    fn node_pool(&self) -> Vec<Node> {
        Vec::new()
    }

    fn state(&self) -> ProvisionerState {
        ProvisionerState {
            dir: PathBuf::from("/tmp/fake"),
            nodes: Vec::new(),
            installer_addr: None,
        }
    }
}

/// Collector that counts calls and optionally fails or stalls
#[derive(Default)]
pub struct RecordingCollector {
    pub calls: Mutex<Vec<(String, usize)>>,
    pub fail: bool,
    pub delay: Option<Duration>,
}

impl RecordingCollector {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Ignores its context and takes `delay` to finish
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LogCollector for RecordingCollector {
    async fn collect_logs(&self, _ctx: &RunContext, label: &str, nodes: &[Node]) -> Result<()> {
        self.calls.lock().push((label.to_string(), nodes.len()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::LogCollection("ssh: connection refused".to_string()));
        }
        Ok(())
    }
}
