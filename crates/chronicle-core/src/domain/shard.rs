//! Shard ownership and cluster metadata consumed by the engine

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::execution::{DomainId, EMPTY_VERSION};

/// Bits of a task id reserved for the per-range sequence
const RANGE_SIZE_BITS: u32 = 20;

/// Source of failover versions
pub trait ClusterMetadata: Send + Sync {
    /// Name of the cluster this process belongs to
    fn current_cluster_name(&self) -> &str;

    /// Failover version to stamp on new events of the domain
    fn failover_version(&self, domain_id: &DomainId) -> i64;
}

/// Single-cluster metadata; every domain is local
#[derive(Debug, Clone)]
pub struct LocalClusterMetadata {
    cluster_name: String,
}

impl LocalClusterMetadata {
    /// Create metadata for a standalone cluster
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }
}

impl Default for LocalClusterMetadata {
    fn default() -> Self {
        Self::new("active")
    }
}

impl ClusterMetadata for LocalClusterMetadata {
    fn current_cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn failover_version(&self, _domain_id: &DomainId) -> i64 {
        EMPTY_VERSION
    }
}

/// Ownership handle of the shard the engine serves
pub struct ShardContext {
    shard_id: i32,
    range_id: AtomicI64,
    task_sequence: AtomicI64,
    cluster_metadata: Arc<dyn ClusterMetadata>,
}

impl ShardContext {
    /// Create a shard context holding `range_id`
    pub fn new(shard_id: i32, range_id: i64, cluster_metadata: Arc<dyn ClusterMetadata>) -> Self {
        Self {
            shard_id,
            range_id: AtomicI64::new(range_id),
            task_sequence: AtomicI64::new(0),
            cluster_metadata,
        }
    }

    /// Shard context for a single local cluster
    pub fn local(shard_id: i32, range_id: i64) -> Self {
        Self::new(shard_id, range_id, Arc::new(LocalClusterMetadata::default()))
    }

    /// Shard id
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Range id presented on every conditional write
    pub fn range_id(&self) -> i64 {
        self.range_id.load(Ordering::Acquire)
    }

    /// Take over a new range after the store bumped it
    pub fn renew_range(&self, range_id: i64) {
        self.range_id.store(range_id, Ordering::Release);
        self.task_sequence.store(0, Ordering::Release);
    }

    /// Allocate a task id unique within the shard
    pub fn next_task_id(&self) -> i64 {
        let seq = self.task_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        (self.range_id() << RANGE_SIZE_BITS) + seq
    }

    /// Cluster metadata
    pub fn cluster_metadata(&self) -> &Arc<dyn ClusterMetadata> {
        &self.cluster_metadata
    }

    /// Failover version for new events of a domain
    pub fn failover_version(&self, domain_id: &DomainId) -> i64 {
        self.cluster_metadata.failover_version(domain_id)
    }

    /// Wall clock of the shard
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard_id", &self.shard_id)
            .field("range_id", &self.range_id())
            .field("cluster", &self.cluster_metadata.current_cluster_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique_and_range_prefixed() {
        let shard = ShardContext::local(1, 3);
        let first = shard.next_task_id();
        let second = shard.next_task_id();

        assert!(second > first);
        assert_eq!(first >> RANGE_SIZE_BITS, 3);

        shard.renew_range(4);
        assert_eq!(shard.next_task_id() >> RANGE_SIZE_BITS, 4);
    }

    #[test]
    fn test_local_cluster_uses_empty_version() {
        let shard = ShardContext::local(1, 1);
        assert_eq!(shard.failover_version(&DomainId("d".to_string())), EMPTY_VERSION);
        assert_eq!(shard.cluster_metadata().current_cluster_name(), "active");
    }
}
