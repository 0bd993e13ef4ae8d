//! Bounded cache of execution contexts with per-execution locks
//!
//! Holding a [`ContextGuard`] is the only way to touch an execution's
//! aggregate. Entries are pinned while held or awaited and are never evicted
//! while pinned; the cache may overflow its capacity until pins are released.

use lru::LruCache;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use super::deadline::OperationContext;
use super::execution_context::ExecutionContext;
use crate::config::EngineConfig;
use crate::domain::execution::ExecutionKey;
use crate::domain::persistence::{ExecutionStore, HistoryStore};
use crate::domain::shard::ShardContext;
use crate::CoreError;

struct CacheEntry {
    context: Arc<AsyncMutex<ExecutionContext>>,
    pins: AtomicUsize,
}

struct CacheInner {
    entries: Mutex<LruCache<ExecutionKey, Arc<CacheEntry>>>,
    capacity: usize,
    sticky_ttl: Option<Duration>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    shard: Arc<ShardContext>,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, LruCache<ExecutionKey, Arc<CacheEntry>>> {
        // The map stays consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pin(self: &Arc<Self>, key: &ExecutionKey) -> EntryPin {
        let mut entries = self.entries();
        let existing = entries.get(key).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = Arc::new(CacheEntry {
                    context: Arc::new(AsyncMutex::new(
                        ExecutionContext::new(
                            key.clone(),
                            self.execution_store.clone(),
                            self.history_store.clone(),
                            self.shard.clone(),
                        )
                        .with_sticky_ttl(self.sticky_ttl),
                    )),
                    pins: AtomicUsize::new(0),
                });
                entries.put(key.clone(), entry.clone());
                entry
            }
        };
        entry.pins.fetch_add(1, Ordering::AcqRel);
        self.evict_overflow(&mut entries);
        EntryPin {
            entry,
            cache: self.clone(),
        }
    }

    fn unpin(&self, entry: &CacheEntry) {
        let mut entries = self.entries();
        entry.pins.fetch_sub(1, Ordering::AcqRel);
        self.evict_overflow(&mut entries);
    }

    fn evict_overflow(&self, entries: &mut LruCache<ExecutionKey, Arc<CacheEntry>>) {
        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.pins.load(Ordering::Acquire) == 0)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    entries.pop(&key);
                    trace!(execution = %key, "Evicted execution from cache");
                }
                None => break,
            }
        }
    }
}

/// One pin on a cache entry, released on drop
///
/// Taken before waiting on the execution lock, so an abandoned wait still
/// unpins the entry.
struct EntryPin {
    entry: Arc<CacheEntry>,
    cache: Arc<CacheInner>,
}

impl Drop for EntryPin {
    fn drop(&mut self) {
        self.cache.unpin(&self.entry);
    }
}

/// Process-wide execution cache; cloning shares the same cache
#[derive(Clone)]
pub struct ExecutionCache {
    inner: Arc<CacheInner>,
}

impl ExecutionCache {
    /// Create a cache holding up to `capacity` unpinned executions
    pub fn new(
        capacity: usize,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard: Arc<ShardContext>,
    ) -> Self {
        Self::build(capacity, None, execution_store, history_store, shard)
    }

    /// Create a cache sized and tuned by the engine configuration
    pub fn from_config(
        config: &EngineConfig,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard: Arc<ShardContext>,
    ) -> Self {
        Self::build(
            config.execution_cache_capacity,
            Some(config.sticky_ttl()),
            execution_store,
            history_store,
            shard,
        )
    }

    fn build(
        capacity: usize,
        sticky_ttl: Option<Duration>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard: Arc<ShardContext>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(LruCache::unbounded()),
                capacity: capacity.max(1),
                sticky_ttl,
                execution_store,
                history_store,
                shard,
            }),
        }
    }

    /// Lock the execution, waiting until the deadline
    pub async fn acquire(
        &self,
        key: ExecutionKey,
        op_ctx: &OperationContext,
    ) -> Result<ContextGuard, CoreError> {
        op_ctx.check()?;
        let pin = self.inner.pin(&key);
        let lock = pin.entry.context.clone().lock_owned();

        let guard = match op_ctx.deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, lock).await {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(execution = %key, "Timed out waiting for execution lock");
                    return Err(CoreError::Timeout(format!(
                        "timed out acquiring lock on {}",
                        key
                    )));
                }
            },
            None => lock.await,
        };

        Ok(ContextGuard {
            guard,
            _pin: pin,
            clear_on_release: false,
        })
    }

    /// Number of cached executions, pinned ones included
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// True when the execution has an entry
    pub fn contains(&self, key: &ExecutionKey) -> bool {
        self.inner.entries().contains(key)
    }

    /// Drop every unpinned entry; returns how many were dropped
    pub fn drain(&self) -> usize {
        let mut entries = self.inner.entries();
        let idle: Vec<ExecutionKey> = entries
            .iter()
            .filter(|(_, entry)| entry.pins.load(Ordering::Acquire) == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            entries.pop(key);
        }
        debug!(drained = idle.len(), remaining = entries.len(), "Drained execution cache");
        idle.len()
    }
}

impl std::fmt::Debug for ExecutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCache")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Exclusive hold on one execution
///
/// Dropping the guard releases it. Releasing with an error, or dropping
/// while panicking, clears the cached aggregate so the next holder reloads.
pub struct ContextGuard {
    guard: OwnedMutexGuard<ExecutionContext>,
    // Dropped after `guard`, so the entry stays pinned until the lock is free
    _pin: EntryPin,
    clear_on_release: bool,
}

impl ContextGuard {
    /// Release the execution; an error discards the cached aggregate
    pub fn release(mut self, error: Option<&CoreError>) {
        if let Some(err) = error {
            debug!(execution = %self.guard.key(), error = %err, "Releasing execution after error");
            self.clear_on_release = true;
        }
    }
}

impl Deref for ContextGuard {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.guard
    }
}

impl DerefMut for ContextGuard {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        &mut self.guard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.clear_on_release || std::thread::panicking() {
            self.guard.clear();
        }
    }
}
