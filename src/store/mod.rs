//! Low-latency key/value store capability.
//!
//! Counters never talk to a concrete store type; they are handed a
//! `&dyn FastStore`. The trait covers exactly the command families the
//! counter subsystem needs: float counters, lists of reals (the rolling
//! parts ring), sorted sets (active-id membership), plain strings
//! (timestamps), batched mutation, and an advisory lock with TTL.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;

/// Pipelined mutations are flushed whenever this many are buffered.
pub const STORE_BATCH_SIZE: usize = 10_000;

/// A single buffered mutation. See [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    IncrFloat { key: String, delta: f64 },
    SetFloat { key: String, value: f64 },
    SetStr { key: String, value: String },
    ListPopFront { key: String },
    ListPushBack { key: String, value: f64 },
    ZSetAdd { key: String, member: String, score: f64 },
    Delete { key: String },
}

/// Capability interface over the fast store.
///
/// All methods are atomic with respect to each other. `apply` commits a
/// batch under a single critical section, so external readers observe it
/// as one step.
pub trait FastStore: Send + Sync {
    fn incr_float(&self, key: &str, delta: f64) -> Result<f64>;
    fn get_float(&self, key: &str) -> Result<Option<f64>>;
    fn set_float(&self, key: &str, value: f64) -> Result<()>;

    fn get_str(&self, key: &str) -> Result<Option<String>>;
    fn set_str(&self, key: &str, value: &str) -> Result<()>;

    fn list_len(&self, key: &str) -> Result<usize>;
    fn list_range(&self, key: &str) -> Result<Vec<f64>>;
    fn list_push_back(&self, key: &str, value: f64) -> Result<()>;
    fn list_pop_front(&self, key: &str) -> Result<Option<f64>>;

    /// Add or update a member with the given score.
    fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Remove members whose score lies in `[min, max]`; returns the count.
    fn zset_remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize>;
    /// All members with scores, ordered by score then member.
    fn zset_scan(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Apply a batch of mutations atomically.
    fn apply(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// SET-if-absent with TTL. Returns whether the lock was taken. A lock
    /// whose TTL has elapsed counts as absent.
    fn lock_acquire(&self, key: &str, token: &str, ttl_secs: u64, now: f64) -> Result<bool>;
    /// Delete the lock only if `token` still matches, so a lock stolen via
    /// TTL expiry is never released by the previous holder.
    fn lock_release(&self, key: &str, token: &str) -> Result<()>;

    /// Delete every key starting with `prefix`; returns the count.
    fn remove_prefix(&self, prefix: &str) -> Result<usize>;

    /// Flush durable state, if the backend is process-local. Remote stores
    /// own their durability and keep this a no-op.
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Buffers [`StoreOp`]s and flushes them in bounded batches.
///
/// `reset` discards everything buffered since the last flush; the periodic
/// rollup uses it to avoid double-applying decrements after an archive
/// failure.
pub struct Pipeline<'a> {
    store: &'a dyn FastStore,
    ops: Vec<StoreOp>,
    batch_size: usize,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn FastStore) -> Self {
        Self::with_batch_size(store, STORE_BATCH_SIZE)
    }

    pub fn with_batch_size(store: &'a dyn FastStore, batch_size: usize) -> Self {
        Self {
            store,
            ops: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Buffer one mutation, flushing if the batch limit is reached.
    pub fn push(&mut self, op: StoreOp) -> Result<()> {
        self.ops.push(op);
        if self.ops.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit everything still buffered.
    pub fn flush(&mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        self.store.apply(ops)
    }

    /// Drop buffered mutations without applying them.
    pub fn reset(&mut self) {
        self.ops.clear();
    }
}

/// RAII guard for the advisory lock described in the counter protocol.
///
/// Acquisition is a single SET-NX-EX equivalent; release compares the token
/// before deleting. Dropping the guard releases the lock.
pub struct AdvisoryLock<'a> {
    store: &'a dyn FastStore,
    key: String,
    token: String,
}

impl<'a> AdvisoryLock<'a> {
    /// Try to take the lock. Returns `None` when another holder owns it.
    pub fn acquire(
        store: &'a dyn FastStore,
        key: &str,
        ttl_secs: u64,
        now: f64,
    ) -> Result<Option<Self>> {
        let token = format!("{:016x}", rand::random::<u64>());
        if store.lock_acquire(key, &token, ttl_secs, now)? {
            Ok(Some(Self {
                store,
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.lock_release(&self.key, &self.token) {
            tracing::warn!(key = %self.key, %err, "failed to release advisory lock");
        }
    }
}
