//! Operation deadlines
//!
//! Every store call and lock acquisition is bounded by the deadline of the
//! operation that issued it. Sub-operations run under a child deadline that
//! is a fraction of the parent's remaining time, capped by a ceiling.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::CoreError;

/// Deadline carried through one engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    deadline: Option<Instant>,
}

impl OperationContext {
    /// Context without a deadline
    pub fn background() -> Self {
        Self { deadline: None }
    }

    /// Context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once the deadline passed
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Fail with `Timeout` when the deadline passed
    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_expired() {
            Err(CoreError::Timeout("operation deadline exceeded".to_string()))
        } else {
            Ok(())
        }
    }

    /// Deadline for a sub-operation: `min(fraction * remaining, ceiling)`
    pub fn child(&self, fraction: f64, ceiling: Duration) -> Self {
        let budget = match self.remaining() {
            Some(remaining) => remaining.mul_f64(fraction).min(ceiling),
            None => ceiling,
        };
        Self::with_timeout(budget)
    }

    /// Context with a deadline; callers that sent none get `fallback`
    pub fn or_timeout(&self, fallback: Duration) -> Self {
        match self.deadline {
            Some(_) => *self,
            None => Self::with_timeout(fallback),
        }
    }

    /// Run `fut` until it resolves or the deadline passes
    pub async fn bound<T, F>(&self, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut).await?,
            None => fut.await,
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

/// Child deadline sized by the engine configuration
pub fn new_child_context(parent: &OperationContext, config: &EngineConfig) -> OperationContext {
    parent.child(config.child_context_fraction, config.child_context_ceiling())
}
