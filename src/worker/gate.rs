//! Bounded admission for worker processes.
//!
//! A fixed pool of permits; one permit is held for the full lifetime of a
//! worker invocation. Permits are released by drop, so every exit path
//! (success, error, cancellation, panic unwinding) gives the slot back
//! exactly once.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("cancelled while waiting for a worker slot")]
    Cancelled,

    #[error("worker gate is closed")]
    Closed,
}

/// Counting gate bounding simultaneous worker processes.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot, or give up when `cancel` fires first.
    ///
    /// Dropping the returned future also abandons the wait; the semaphore
    /// keeps no stale waiter in either case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| GateError::Closed)?
            }
        };

        metrics::record_worker_slot_acquired();
        tracing::debug!(
            in_use = self.in_use(),
            capacity = self.capacity,
            "Worker slot acquired"
        );

        Ok(GatePermit { _permit: permit })
    }

    /// Give a permit back. Equivalent to dropping it.
    pub fn release(&self, permit: GatePermit) {
        drop(permit);
    }

    /// Refuse new slots. Waiters and later callers get [`GateError::Closed`];
    /// permits already held stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held worker slot. Released when dropped.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        metrics::record_worker_slot_released();
    }
}
