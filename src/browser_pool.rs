//! Fixed-size pool of rendering sessions
//!
//! The pool launches every session once at startup and hands them out one
//! task at a time. Waiters are served in arrival order through a fair
//! semaphore; a slot goes back to the end of the available queue when it is
//! released.

use crate::{BrowserSession, SessionProvider, SolverError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A launched session together with its usage statistics
pub struct PooledSession {
    /// 1-based slot number, stable for the lifetime of the pool
    pub index: usize,
    /// The launched browser backing this slot
    pub session: Box<dyn BrowserSession>,
    /// Number of times this slot has been checked out
    pub solve_count: usize,
    /// When the session was launched
    pub created_at: Instant,
}

impl PooledSession {
    fn new(index: usize, session: Box<dyn BrowserSession>) -> Self {
        Self {
            index,
            session,
            solve_count: 0,
            created_at: Instant::now(),
        }
    }

    fn mark_used(&mut self) {
        self.solve_count += 1;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Exclusive hold on one pooled session
///
/// Hand it back with [`BrowserPool::release`]. A slot dropped without being
/// released is returned from a background task.
pub struct PoolSlot {
    instance: Option<PooledSession>,
    permit: Option<OwnedSemaphorePermit>,
    pool: BrowserPool,
}

impl PoolSlot {
    pub fn index(&self) -> usize {
        self.instance.as_ref().map(|i| i.index).unwrap_or_default()
    }

    pub fn session(&self) -> &dyn BrowserSession {
        // Only `release` and `drop` take the instance, and both consume the slot.
        self.instance
            .as_ref()
            .map(|i| i.session.as_ref())
            .unwrap_or_else(|| unreachable!("pool slot used after release"))
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            warn!("Pool slot {} dropped without release, returning it", instance.index);
            let pool = self.pool.clone();
            let permit = self.permit.take();
            tokio::spawn(async move {
                pool.return_instance(instance).await;
                drop(permit);
            });
        }
    }
}

pub struct BrowserPool {
    available: Arc<Mutex<VecDeque<PooledSession>>>,
    semaphore: Arc<Semaphore>,
    size: usize,
    checked_out: Arc<AtomicUsize>,
    total_solves: Arc<AtomicUsize>,
    is_shutting_down: Arc<AtomicBool>,
}

impl BrowserPool {
    /// Launch `size` sessions from `provider`, one after another.
    ///
    /// Any launch failure shuts down the sessions started so far and returns
    /// [`SolverError::PoolInit`].
    pub async fn initialize(
        size: usize,
        provider: &dyn SessionProvider,
    ) -> Result<Self, SolverError> {
        if size == 0 {
            return Err(SolverError::PoolInit(
                "pool size must be greater than 0".to_string(),
            ));
        }

        let mut instances = VecDeque::with_capacity(size);
        for index in 1..=size {
            match provider.launch(index).await {
                Ok(session) => {
                    info!("Browser {} initialized successfully", index);
                    instances.push_back(PooledSession::new(index, session));
                }
                Err(e) => {
                    error!("Failed to create browser {}: {}", index, e);
                    for instance in instances.drain(..) {
                        instance.session.shutdown().await;
                    }
                    return Err(SolverError::PoolInit(format!("browser {index}: {e}")));
                }
            }
        }

        info!("Browser pool initialized with {} browsers", instances.len());

        Ok(Self {
            available: Arc::new(Mutex::new(instances)),
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            checked_out: Arc::new(AtomicUsize::new(0)),
            total_solves: Arc::new(AtomicUsize::new(0)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wait for a free slot, first come first served.
    pub async fn acquire(&self) -> Result<PoolSlot, SolverError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(SolverError::Browser("browser pool is shutting down".to_string()));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SolverError::Browser("browser pool is closed".to_string()))?;

        let (mut instance, checked_out) = {
            let mut available = self.available.lock().await;
            let instance = available
                .pop_front()
                .ok_or_else(|| SolverError::Browser("no browser available".to_string()))?;
            (instance, self.checked_out.fetch_add(1, Ordering::SeqCst) + 1)
        };
        instance.mark_used();

        self.total_solves.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_pool_usage(checked_out, self.size);
        debug!("Browser {} checked out ({}/{} busy)", instance.index, checked_out, self.size);

        Ok(PoolSlot {
            instance: Some(instance),
            permit: Some(permit),
            pool: self.clone(),
        })
    }

    /// Return a slot to the back of the available queue.
    pub async fn release(&self, mut slot: PoolSlot) {
        let permit = slot.permit.take();
        if let Some(instance) = slot.instance.take() {
            self.return_instance(instance).await;
        }
        // The session is queued before its permit frees up, so a woken
        // waiter always finds it.
        drop(permit);
    }

    async fn return_instance(&self, instance: PooledSession) {
        let index = instance.index;
        let checked_out = {
            let mut available = self.available.lock().await;
            available.push_back(instance);
            self.checked_out.fetch_sub(1, Ordering::SeqCst) - 1
        };
        crate::metrics::record_pool_usage(checked_out, self.size);
        debug!("Browser {} released ({}/{} busy)", index, checked_out, self.size);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn get_stats(&self) -> PoolStats {
        // Counters move under the queue lock, so this view is consistent
        let available = self.available.lock().await;
        PoolStats {
            total: self.size,
            available: available.len(),
            checked_out: self.checked_out.load(Ordering::SeqCst),
            total_solves: self.total_solves.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        // Give in-flight solves a moment to hand their slots back
        let mut retries = 0;
        while retries < 10 {
            if self.available.lock().await.len() == self.size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }

        self.semaphore.close();
        let mut available = self.available.lock().await;
        for instance in available.drain(..) {
            debug!(
                "Closing browser {} after {} solves ({:?} old)",
                instance.index,
                instance.solve_count,
                instance.age()
            );
            instance.session.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            size: self.size,
            checked_out: self.checked_out.clone(),
            total_solves: self.total_solves.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub checked_out: usize,
    pub total_solves: usize,
}
