//! Registry of queries waiting on the next decision task
//!
//! A query moves `Buffered -> Started -> Completed | Failed`. Started queries
//! go back to `Buffered` when their decision fails or times out. Terminal
//! outcomes are held until [`QueryRegistry::notify_terminated`] runs after a
//! successful persist, so a lost optimistic race never leaks an answer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::events::Payload;

/// A query issued against a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    /// Query handler name
    pub query_type: String,
    /// Query arguments
    pub query_args: Payload,
}

/// Lifecycle position of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryState {
    /// Waiting for a decision task
    Buffered,
    /// Handed to a worker with a decision task
    Started,
    /// Answered by the worker
    Completed,
    /// Failed by the worker or by the engine
    Failed,
}

/// Kind of answer a worker gives to a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResultType {
    /// Query handler returned an answer
    Answered,
    /// Query handler failed
    Failed,
}

/// Answer a worker attaches to a completed decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowQueryResult {
    /// Answer kind
    pub result_type: QueryResultType,
    /// Answer payload
    pub answer: Option<Payload>,
    /// Failure message
    pub error_message: Option<String>,
}

/// Terminal outcome delivered to the query caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Worker answered
    Answered(Payload),
    /// Query failed with a reason
    Failed(String),
}

impl From<WorkflowQueryResult> for QueryOutcome {
    fn from(result: WorkflowQueryResult) -> Self {
        match result.result_type {
            QueryResultType::Answered => QueryOutcome::Answered(result.answer.unwrap_or_default()),
            QueryResultType::Failed => QueryOutcome::Failed(
                result
                    .error_message
                    .unwrap_or_else(|| "query failed without a message".to_string()),
            ),
        }
    }
}

/// Receiver side of a query's termination notifier
pub type QueryTermination = watch::Receiver<Option<QueryOutcome>>;

#[derive(Debug, Clone)]
struct QueryEntry {
    query: WorkflowQuery,
    state: QueryState,
    outcome: Option<QueryOutcome>,
    notifier: Arc<watch::Sender<Option<QueryOutcome>>>,
}

/// Per-execution registry of in-flight queries
///
/// Cloning shares the notifiers, so a clone taken as a checkpoint and later
/// restored still wakes the original callers.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    entries: BTreeMap<String, QueryEntry>,
}

impl QueryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a new query and return its id and termination receiver
    pub fn buffer_query(&mut self, query: WorkflowQuery) -> (String, QueryTermination) {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = watch::channel(None);
        self.entries.insert(
            id.clone(),
            QueryEntry {
                query,
                state: QueryState::Buffered,
                outcome: None,
                notifier: Arc::new(sender),
            },
        );
        (id, receiver)
    }

    /// State of a query still held by the registry
    pub fn state_of(&self, id: &str) -> Option<QueryState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// True when a query waits for a decision task
    pub fn has_buffered_query(&self) -> bool {
        self.entries.values().any(|e| e.state == QueryState::Buffered)
    }

    /// Ids of queries in the given state
    pub fn ids_in_state(&self, state: QueryState) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of queries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no query is held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every buffered query to started
    pub fn start_buffered_queries(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == QueryState::Buffered {
                entry.state = QueryState::Started;
            }
        }
    }

    /// Queries currently handed to a worker
    pub fn started_queries(&self) -> BTreeMap<String, WorkflowQuery> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == QueryState::Started)
            .map(|(id, e)| (id.clone(), e.query.clone()))
            .collect()
    }

    /// Record a worker's answer for a started query; returns false for unknown or unstarted ids
    pub fn complete_query(&mut self, id: &str, result: WorkflowQueryResult) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.state == QueryState::Started => {
                let outcome = QueryOutcome::from(result);
                entry.state = match outcome {
                    QueryOutcome::Answered(_) => QueryState::Completed,
                    QueryOutcome::Failed(_) => QueryState::Failed,
                };
                entry.outcome = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Fail every started query the worker did not answer
    pub fn fail_started_queries(&mut self, reason: &str) {
        self.fail_where(reason, |state| state == QueryState::Started);
    }

    /// Return started queries to the buffer after their decision was lost
    pub fn return_started_to_buffered(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == QueryState::Started {
                entry.state = QueryState::Buffered;
            }
        }
    }

    /// Fail every query that has not terminated yet
    pub fn fail_all(&mut self, reason: &str) {
        self.fail_where(reason, |state| {
            matches!(state, QueryState::Buffered | QueryState::Started)
        });
    }

    /// Drop a query without notifying its caller
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Deliver terminal outcomes and drop the terminated entries
    pub fn notify_terminated(&mut self) -> usize {
        let terminated: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.outcome.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &terminated {
            if let Some(entry) = self.entries.remove(id) {
                // A caller that gave up has dropped its receiver
                let _ = entry.notifier.send(entry.outcome);
            }
        }
        terminated.len()
    }

    fn fail_where(&mut self, reason: &str, predicate: impl Fn(QueryState) -> bool) {
        for entry in self.entries.values_mut() {
            if predicate(entry.state) {
                entry.state = QueryState::Failed;
                entry.outcome = Some(QueryOutcome::Failed(reason.to_string()));
            }
        }
    }
}
