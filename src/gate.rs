//! Bounded admission for processing functions.
//!
//! This module provides [`ProcessGate`], the counting semaphore that caps
//! how many user processing functions execute simultaneously. Repository
//! calls are not admitted through the gate; connection pooling governs
//! persistence concurrency on its own.

use crate::{MillraceError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting semaphore bounding in-flight processing functions.
///
/// Cloning the gate shares the underlying capacity. A task must hold a
/// [`ProcessPermit`] while a processing function runs; the permit is
/// released when dropped, so completion, failure, and cancellation all
/// return capacity to the gate.
///
/// # Example
///
/// ```
/// use millrace::ProcessGate;
///
/// # async fn example() -> millrace::Result<()> {
/// let gate = ProcessGate::new(2);
/// let first = gate.admit().await?;
/// let second = gate.admit().await?;
/// assert_eq!(gate.available(), 0);
/// drop(first);
/// assert_eq!(gate.available(), 1);
/// # drop(second);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ProcessGate {
    /// Creates a gate admitting at most `capacity` concurrent processors.
    ///
    /// A capacity of zero is treated as one; the gate must always be able
    /// to make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a permit, suspending while the gate is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`MillraceError::Task`] if the gate's semaphore has been
    /// closed, which does not happen in normal operation.
    pub async fn admit(&self) -> Result<ProcessPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MillraceError::Task("concurrency gate closed".to_string()))?;
        Ok(ProcessPermit { _permit: permit })
    }
}

/// An admission token for one processing-function invocation.
///
/// Dropping the permit returns capacity to the gate.
#[derive(Debug)]
pub struct ProcessPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let gate = ProcessGate::new(0);
        assert_eq!(gate.capacity(), 1);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_admit_and_release() {
        let gate = ProcessGate::new(3);
        let permit = gate.admit().await.unwrap();
        assert_eq!(gate.available(), 2);
        drop(permit);
        assert_eq!(gate.available(), 3);
    }

    #[tokio::test]
    async fn test_clone_shares_capacity() {
        let gate = ProcessGate::new(2);
        let other = gate.clone();
        let _permit = gate.admit().await.unwrap();
        assert_eq!(other.available(), 1);
    }

    #[tokio::test]
    async fn test_admission_suspends_at_capacity() {
        let gate = ProcessGate::new(1);
        let held = gate.admit().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.admit().await.unwrap();
            })
        };

        // The waiter cannot finish while the permit is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_bound_holds_under_load() {
        let gate = ProcessGate::new(4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let gate = gate.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.admit().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(gate.available(), 4);
    }

    #[tokio::test]
    async fn test_permit_released_on_task_abort() {
        let gate = ProcessGate::new(1);

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.admit().await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };

        // Give the task time to take the permit, then cancel it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.available(), 0);
        holder.abort();
        let _ = holder.await;

        assert_eq!(gate.available(), 1);
    }
}
