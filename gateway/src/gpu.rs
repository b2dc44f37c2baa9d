//! GPU admission control.
//!
//! The GPU is the one contended resource in the process. Every orchestrator
//! mutation runs inside [`GpuLock::with_gpu`], so model load/evict transitions
//! are totally ordered. The tokio mutex is fair: waiters are woken in enqueue
//! order, so a request that starts waiting first loads first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Wall-clock bound on one critical section. Generous because a cold load may
/// include a first-time model download.
pub const GPU_TASK_DEADLINE: Duration = Duration::from_secs(360);

#[derive(Clone)]
pub struct GpuLock {
    inner: Arc<Mutex<()>>,
    deadline: Duration,
}

impl Default for GpuLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuLock {
    pub fn new() -> Self {
        Self::with_deadline(GPU_TASK_DEADLINE)
    }

    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            deadline,
        }
    }

    /// Run `task` while holding the GPU. The guard is released on every exit
    /// path, deadline overrun included; holders may suspend on I/O without
    /// pinning a thread.
    pub async fn with_gpu<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = self.inner.lock().await;
        match tokio::time::timeout(self.deadline, task).await {
            Ok(result) => result,
            Err(_) => Err(Error::GpuTimeout(self.deadline.as_secs())),
        }
    }
}
