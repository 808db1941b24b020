use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::constants::*;

/// Admission-controlled task pool.
///
/// The runtime's internal queue is unbounded, so submission itself never
/// rejects work; the counting token bucket (`num_workers + preload_slack`
/// permits) is the sole admission gate. `submit` blocks the caller until a
/// token is free, and the token is released on every completion path,
/// including panics.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    workers: usize,
    capacity: usize,
    active: AtomicUsize,
    high_water: AtomicUsize,
    draining: AtomicBool,
    aborts: Mutex<Vec<AbortHandle>>,
}

pub struct TaskHandle<R> {
    handle: JoinHandle<R>,
}

impl TaskPool {
    pub fn new(num_workers: usize, preload_slack: usize) -> Self {
        let workers = num_workers.max(1);
        let capacity = workers + preload_slack;
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(capacity)),
                workers,
                capacity,
                active: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                aborts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Submit one unit of work. Blocks until an admission token is free;
    /// this is the pool's only blocking point from the caller's perspective.
    pub async fn submit<F, R>(&self, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("task pool is shutting down; submission rejected"));
        }

        let permit = match Arc::clone(&self.inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "task pool admission gate is closed; submission rejected"
                ))
            }
        };

        let current = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(current, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _active = ActiveGuard(inner);
            work()
        });

        let mut aborts = self.inner.aborts.lock();
        aborts.retain(|abort| !abort.is_finished());
        aborts.push(handle.abort_handle());

        Ok(TaskHandle { handle })
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Token bucket size: workers plus preload slack.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tasks currently holding an admission token (queued or running).
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Most tokens ever held at once. Never exceeds `capacity`.
    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::SeqCst)
    }

    /// Stop admissions and let in-flight work drain, bounded by `timeout`;
    /// on timeout the remaining tasks are force-cancelled. Returns whether
    /// the pool drained cleanly.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.draining.store(true, Ordering::SeqCst);
        self.inner.permits.close();

        let deadline = Instant::now() + timeout;
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                for abort in self.inner.aborts.lock().iter() {
                    abort.abort();
                }
                return false;
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_CHECK_INTERVAL_MS)).await;
        }
        true
    }
}

struct ActiveGuard(Arc<PoolInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R> TaskHandle<R> {
    pub async fn join(self) -> Result<R> {
        match self.handle.await {
            Ok(value) => Ok(value),
            Err(error) if error.is_panic() => Err(anyhow::anyhow!("worker task panicked")),
            Err(_) => Err(anyhow::anyhow!("worker task was cancelled")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}
