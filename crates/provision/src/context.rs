//! Cancellation and deadline scopes
//!
//! A [`RunContext`] bounds a piece of work in time and lets an operator or
//! a parent scope abort it. Children created with [`RunContext::with_timeout`]
//! observe their parent's cancellation and deadline. Cleanup that must still
//! run after a scope died uses [`RunContext::detached`], a fresh root that
//! shares nothing with the dead scope.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testbed_common::Interruption;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation + deadline scope for long-running operations
#[derive(Debug, Clone)]
pub struct RunContext {
    id: u64,
    /// Ids of all ancestors, root first
    ancestors: Arc<[u64]>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// Root context without a deadline
    pub fn background() -> Self {
        Self::root(None)
    }

    /// Fresh root context bounded by `timeout`
    ///
    /// Used for finalization after the scope that owned the work has been
    /// cancelled or has expired.
    pub fn detached(timeout: Duration) -> Self {
        Self::root(Some(Instant::now() + timeout))
    }

    fn root(deadline: Option<Instant>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ancestors: Arc::from(Vec::new()),
            token: CancellationToken::new(),
            deadline,
        }
    }

    /// Child scope, cancelled with this one
    pub fn child(&self) -> Self {
        self.derive(self.deadline)
    }

    /// Child scope bounded by `min(remaining time, timeout)`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let mut ancestors = self.ancestors.to_vec();
        ancestors.push(self.id);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ancestors: Arc::from(ancestors),
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Cancel this scope and all of its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why this scope is done, or `None` while it is still live
    pub fn err(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interruption::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the scope is cancelled or its deadline passes
    pub async fn done(&self) -> Interruption {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Interruption::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    // cancellation wins a tie
                    self.err().unwrap_or(Interruption::DeadlineExceeded)
                }
            },
            None => {
                self.token.cancelled().await;
                Interruption::Cancelled
            }
        }
    }

    /// Run `fut` unless the scope ends first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }
        tokio::select! {
            out = fut => Ok(out),
            cause = self.done() => Err(cause),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True if `other` is this scope or one of its ancestors
    pub fn is_derived_from(&self, other: &RunContext) -> bool {
        self.id == other.id || self.ancestors.contains(&other.id)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::background()
    }
}
