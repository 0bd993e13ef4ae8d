//! Optimistic concurrency retry loop
//!
//! Every mutating engine operation runs through [`with_optimistic_retry`]:
//! load the aggregate, run the mutation against it, conditionally persist.
//! A lost race discards the aggregate and runs the mutation again against
//! freshly loaded state, so request-id checks are always re-evaluated.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::deadline::OperationContext;
use super::execution_cache::ExecutionCache;
use crate::domain::execution::ExecutionKey;
use crate::domain::mutable_state::MutableState;
use crate::domain::query_registry::QueryRegistry;
use crate::CoreError;

/// Outcome of a mutation closure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    /// State changed; persist before returning `T`
    Persist(T),
    /// Nothing to write; return `T` as is
    Unchanged(T),
}

/// A loadable, conditionally persistable aggregate holder
#[async_trait]
pub trait ConditionalUpdate: Send {
    /// Current aggregate, loading it if needed
    async fn load(&mut self) -> Result<&mut MutableState, CoreError>;

    /// Conditionally write pending changes
    async fn persist(&mut self) -> Result<(), CoreError>;

    /// Discard the aggregate; `retained_queries` is reattached on the next load
    fn invalidate(&mut self, retained_queries: QueryRegistry);
}

/// Run `mutate` under optimistic concurrency control
///
/// Conditional failures, from the store or reported by `mutate` for a stale
/// aggregate, are retried up to `max_attempts` times before failing with
/// `MaxAttemptsExceeded`. Every other error discards the aggregate and is
/// returned unchanged. An expired deadline stops the loop with `Timeout`.
pub async fn with_optimistic_retry<C, T, F>(
    target: &mut C,
    max_attempts: usize,
    op_ctx: &OperationContext,
    mut mutate: F,
) -> Result<T, CoreError>
where
    C: ConditionalUpdate + ?Sized,
    T: Send,
    F: FnMut(&mut MutableState) -> Result<Mutation<T>, CoreError> + Send,
{
    for attempt in 1..=max_attempts {
        op_ctx.check()?;

        let state = op_ctx.bound(target.load()).await?;
        let checkpoint = state.query_registry().clone();

        let value = match mutate(state) {
            Ok(Mutation::Unchanged(value)) => return Ok(value),
            Ok(Mutation::Persist(value)) => value,
            Err(err) if err.is_condition_failed() => {
                debug!(attempt, error = %err, "Mutation saw stale state, reloading");
                target.invalidate(checkpoint);
                continue;
            }
            Err(err) => {
                target.invalidate(checkpoint);
                return Err(err);
            }
        };

        match op_ctx.bound(target.persist()).await {
            Ok(()) => return Ok(value),
            Err(err) if err.is_condition_failed() => {
                debug!(attempt, max_attempts, "Conditional update failed, retrying");
                target.invalidate(checkpoint);
            }
            Err(err) => {
                target.invalidate(checkpoint);
                return Err(err);
            }
        }
    }

    warn!(max_attempts, "Retry budget exhausted for conditional update");
    Err(CoreError::MaxAttemptsExceeded)
}

/// Acquire the execution, run the retry loop, release with the outcome
pub async fn update_workflow_execution<T, F>(
    cache: &ExecutionCache,
    key: ExecutionKey,
    max_attempts: usize,
    op_ctx: &OperationContext,
    mutate: F,
) -> Result<T, CoreError>
where
    T: Send,
    F: FnMut(&mut MutableState) -> Result<Mutation<T>, CoreError> + Send,
{
    let mut guard = cache.acquire(key, op_ctx).await?;
    let result = with_optimistic_retry(&mut *guard, max_attempts, op_ctx, mutate).await;
    guard.release(result.as_ref().err());
    result
}
