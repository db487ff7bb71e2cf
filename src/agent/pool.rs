//! Fixed-size pool of preallocated command records
//!
//! Free records sit in a FIFO guarded by a counting semaphore: a permit
//! exists for every record in the FIFO, so acquiring a permit guarantees a
//! record can be popped.

use super::command::Command;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct CommandPool {
    id: u64,
    capacity: usize,
    free: Mutex<VecDeque<Command>>,
    available: Semaphore,
}

impl CommandPool {
    /// Create a pool with every record free.
    pub fn new(capacity: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free: VecDeque<Command> = (0..capacity).map(|_| Command::pooled(id)).collect();
        Self {
            id,
            capacity,
            free: Mutex::new(free),
            available: Semaphore::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently free
    pub fn available(&self) -> usize {
        self.lock_free().len()
    }

    /// Take a free record, waiting up to `block` for one to be released.
    ///
    /// A zero `block` never waits.
    pub async fn acquire(&self, block: Duration) -> Option<Command> {
        let permit = if block.is_zero() {
            self.available.try_acquire().ok()?
        } else {
            tokio::time::timeout(block, self.available.acquire())
                .await
                .ok()?
                .ok()?
        };
        permit.forget();

        let record = self.lock_free().pop_front();
        if record.is_none() {
            // Permits and records are kept in lockstep by `release`.
            warn!(pool_id = self.id, "Command pool permit without a free record");
        }
        record
    }

    /// Return a record obtained from [`acquire`](Self::acquire).
    ///
    /// Records from another pool, or created outside any pool, are dropped
    /// without touching this pool.
    pub fn release(&self, mut record: Command) {
        if record.pool_id() != Some(self.id) {
            debug!(
                pool_id = self.id,
                record_pool = ?record.pool_id(),
                "Ignoring release of a record this pool does not own"
            );
            return;
        }

        record.reset();
        {
            let mut free = self.lock_free();
            if free.len() >= self.capacity {
                warn!(pool_id = self.id, "Command pool already full, dropping record");
                return;
            }
            free.push_back(record);
        }
        self.available.add_permits(1);
    }

    fn lock_free(&self) -> MutexGuard<'_, VecDeque<Command>> {
        // Nothing panics while the lock is held, so a poisoned lock still
        // holds a consistent queue.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
