//! Bounded task pools.
//!
//! A [`TaskPool`] caps how many submitted tasks run at once. Submission is
//! either non-blocking ([`TaskPool::try_spawn`], failing with
//! `PoolSaturated` when every slot is busy) or blocking
//! ([`TaskPool::spawn`], waiting for a slot). Panics inside tasks are
//! caught and logged; a pool created with [`PanicPolicy::Fatal`] aborts
//! the process instead, for work that must never be silently lost.

use crate::error::{Result, RookeryError};
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::error;

/// What to do when a pooled task panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicPolicy {
    /// Log the panic and keep the pool running.
    Log,
    /// Log the panic and abort the process.
    Fatal,
}

pub struct TaskPool {
    name: &'static str,
    size: usize,
    sem: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    panic_policy: PanicPolicy,
}

impl TaskPool {
    pub fn new(name: &'static str, size: usize, panic_policy: PanicPolicy) -> Self {
        Self {
            name,
            size,
            sem: Arc::new(Semaphore::new(size)),
            running: Arc::new(AtomicUsize::new(0)),
            panic_policy,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Submit without waiting; fails when the pool is saturated.
    pub fn try_spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .sem
            .clone()
            .try_acquire_owned()
            .map_err(|_| RookeryError::PoolSaturated(self.name.to_string()))?;
        self.run(permit, task);
        Ok(())
    }

    /// Submit, waiting for a free slot.
    pub async fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RookeryError::Canceled)?;
        self.run(permit, task);
        Ok(())
    }

    fn run<F>(&self, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let running = Arc::clone(&self.running);
        let name = self.name;
        let policy = self.panic_policy;
        tokio::spawn(async move {
            running.fetch_add(1, Ordering::Relaxed);
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            running.fetch_sub(1, Ordering::Relaxed);
            drop(permit);

            if let Err(payload) = outcome {
                let msg = panic_message(&payload);
                let stack = Backtrace::force_capture();
                error!(pool = name, panic = %msg, stack = %stack, "pooled task panicked");
                if policy == PanicPolicy::Fatal {
                    std::process::abort();
                }
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn try_spawn_fails_when_saturated() {
        let pool = TaskPool::new("test", 1, PanicPolicy::Log);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.try_spawn(async move {
            let _ = release_rx.await;
        })
        .unwrap();

        // Single slot is busy.
        let err = pool.try_spawn(async {}).unwrap_err();
        assert!(matches!(err, RookeryError::PoolSaturated(_)));

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.try_spawn(async {}).unwrap();
    }

    #[tokio::test]
    async fn blocking_spawn_waits_for_slot() {
        let pool = Arc::new(TaskPool::new("test", 1, PanicPolicy::Log));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.try_spawn(async move {
            let _ = release_rx.await;
        })
        .unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.spawn(async {}).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn panic_is_caught_and_slot_released() {
        let pool = TaskPool::new("test", 1, PanicPolicy::Log);
        pool.try_spawn(async {
            panic!("boom");
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The pool survived and the slot came back.
        pool.try_spawn(async {}).unwrap();
    }
}
