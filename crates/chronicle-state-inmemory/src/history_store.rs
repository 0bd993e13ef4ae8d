use std::collections::HashMap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use chronicle_core::domain::events::HistoryEvent;
use chronicle_core::domain::persistence::{
    AppendHistoryNodesRequest, AppendHistoryNodesResponse, HistoryStore, PersistenceError,
    ReadHistoryBranchRequest, ReadHistoryBranchResponse,
};

#[derive(Debug, Clone)]
struct Batch {
    prev_transaction_id: i64,
    events: Vec<HistoryEvent>,
}

type Branch = HashMap<i64, Batch>;

/// In-memory history branches keyed by branch token
///
/// Batches are kept per transaction id and linked to the batch they extend.
/// Reads follow the links back from the transaction id the execution row
/// committed, so a batch whose writer lost the conditional update stays in
/// the store but is never returned.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    branches: RwLock<HashMap<Vec<u8>, Branch>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed event of a branch, ending with `last_transaction_id`
    pub async fn committed_events(
        &self,
        branch_token: &[u8],
        last_transaction_id: i64,
    ) -> Result<Vec<HistoryEvent>, PersistenceError> {
        let branches = self.branches.read().await;
        let branch = branches
            .get(branch_token)
            .ok_or_else(|| PersistenceError::EntityNotExists("History branch not found.".to_string()))?;
        committed_chain(branch, last_transaction_id)
    }

    /// Number of batches written to a branch, committed or not
    pub async fn batch_count(&self, branch_token: &[u8]) -> usize {
        self.branches
            .read()
            .await
            .get(branch_token)
            .map_or(0, |branch| branch.len())
    }
}

fn committed_chain(branch: &Branch, last_transaction_id: i64) -> Result<Vec<HistoryEvent>, PersistenceError> {
    let mut chain = Vec::new();
    let mut transaction_id = last_transaction_id;
    while transaction_id != 0 {
        if chain.len() >= branch.len() {
            return Err(PersistenceError::Internal(format!(
                "history chain loops at transaction {}",
                transaction_id
            )));
        }
        let batch = branch.get(&transaction_id).ok_or_else(|| {
            PersistenceError::Internal(format!("history chain broken at transaction {}", transaction_id))
        })?;
        chain.push(batch);
        transaction_id = batch.prev_transaction_id;
    }
    Ok(chain
        .into_iter()
        .rev()
        .flat_map(|batch| batch.events.iter().cloned())
        .collect())
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> Result<AppendHistoryNodesResponse, PersistenceError> {
        let first_event_id = match request.events.first() {
            Some(first) => first.event_id,
            None => return Ok(AppendHistoryNodesResponse { size: 0 }),
        };
        let size = serde_json::to_vec(&request.events)
            .map_err(|e| PersistenceError::Internal(format!("failed to encode history batch: {}", e)))?
            .len();

        let mut branches = self.branches.write().await;
        let branch = branches.entry(request.branch_token).or_default();
        let expected_first = if request.prev_transaction_id == 0 {
            1
        } else {
            let prev = branch.get(&request.prev_transaction_id).ok_or_else(|| {
                PersistenceError::Internal(format!(
                    "history gap: batch {} extends unknown batch {}",
                    request.transaction_id, request.prev_transaction_id
                ))
            })?;
            prev.events.last().map_or(1, |last| last.event_id + 1)
        };
        if first_event_id != expected_first {
            return Err(PersistenceError::Internal(format!(
                "history gap: batch {} starts at {}, expected {}",
                request.transaction_id, first_event_id, expected_first
            )));
        }

        branch.insert(
            request.transaction_id,
            Batch {
                prev_transaction_id: request.prev_transaction_id,
                events: request.events,
            },
        );
        trace!(
            transaction_id = request.transaction_id,
            prev_transaction_id = request.prev_transaction_id,
            size,
            "Appended history batch"
        );
        Ok(AppendHistoryNodesResponse { size })
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse, PersistenceError> {
        let events = self
            .committed_events(&request.branch_token, request.last_transaction_id)
            .await?
            .into_iter()
            .filter(|event| event.event_id >= request.min_event_id && event.event_id < request.max_event_id)
            .collect();
        Ok(ReadHistoryBranchResponse { events })
    }
}
