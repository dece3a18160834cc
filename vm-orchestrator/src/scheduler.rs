//! Per-environment worker pools and single-flight by entity id.
//!
//! Each environment gets a FIFO semaphore sized from its `max_concurrent`
//! setting (or the default worker count), re-read on every admission. A
//! pipeline holds a permit for its whole run, so standalone requests and
//! deployment children share one queue per environment.
//!
//! Single-flight is an in-process claim set. Claims are taken before the
//! triggering status write and released when the spawned work finishes.

use crate::error::{OrchestratorError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use vm_gateway::GatewayProvider;

pub const DEFAULT_WORKERS: usize = 4;

/// Entity a run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkKey {
    Request(String),
    Deployment(String),
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(id) => write!(f, "request {id}"),
            Self::Deployment(id) => write!(f, "deployment {id}"),
        }
    }
}

/// Exclusive right to run one entity. Released on drop.
#[derive(Debug)]
pub struct Claim {
    inner: Arc<SchedulerInner>,
    key: WorkKey,
}

impl Claim {
    pub fn key(&self) -> &WorkKey {
        &self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.key);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Slots of one environment. `surplus` counts slots still held by running
/// pipelines after a shrink; they are retired as they come back.
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    surplus: usize,
}

impl WorkerPool {
    fn resize(&mut self, workers: usize) {
        if workers > self.size {
            let grow = workers - self.size;
            let cancelled = grow.min(self.surplus);
            self.surplus -= cancelled;
            self.semaphore.add_permits(grow - cancelled);
        } else {
            let shrink = self.size - workers;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.surplus += shrink - forgotten;
        }
        self.size = workers;
    }
}

struct SchedulerInner {
    gateways: Arc<dyn GatewayProvider>,
    default_workers: usize,
    pools: Mutex<HashMap<String, WorkerPool>>,
    in_flight: Mutex<HashSet<WorkKey>>,
    active: AtomicUsize,
    idle: Notify,
}

impl fmt::Debug for SchedulerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerInner")
            .field("default_workers", &self.default_workers)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements the active count even when the task panics.
struct ActiveGuard(Arc<SchedulerInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Scheduler {
    pub fn new(gateways: Arc<dyn GatewayProvider>, default_workers: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                gateways,
                default_workers: default_workers.max(1),
                pools: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Claim `key`, failing with `AlreadyRunning` if a run holds it.
    pub fn claim(&self, key: WorkKey) -> Result<Claim> {
        let mut in_flight = lock(&self.inner.in_flight);
        if !in_flight.insert(key.clone()) {
            return Err(OrchestratorError::AlreadyRunning(format!(
                "{key} already has a run in flight"
            )));
        }
        Ok(Claim {
            inner: Arc::clone(&self.inner),
            key,
        })
    }

    pub fn is_running(&self, key: &WorkKey) -> bool {
        lock(&self.inner.in_flight).contains(key)
    }

    /// Wait for a worker slot in `environment`.
    ///
    /// The pool follows the environment's current `max_concurrent`: a
    /// larger setting frees slots at once, a smaller one takes effect as
    /// running pipelines give their slots back.
    pub async fn permit(&self, environment: &str) -> Result<OwnedSemaphorePermit> {
        let workers = self.configured_workers(environment);
        let semaphore = self.pool(environment, workers);

        loop {
            let permit = Arc::clone(&semaphore).acquire_owned().await.map_err(|_| {
                OrchestratorError::InvalidState(format!(
                    "worker pool for environment {environment} is closed"
                ))
            })?;
            if !self.retire_slot(environment) {
                return Ok(permit);
            }
            permit.forget();
        }
    }

    /// Read from settings without holding the pool lock.
    fn configured_workers(&self, environment: &str) -> usize {
        self.inner
            .gateways
            .environment_info(environment)
            .ok()
            .flatten()
            .and_then(|info| info.max_concurrent)
            .unwrap_or(self.inner.default_workers)
            .max(1)
    }

    fn pool(&self, environment: &str, workers: usize) -> Arc<Semaphore> {
        let mut pools = lock(&self.inner.pools);
        let pool = pools.entry(environment.to_string()).or_insert_with(|| {
            info!(environment, workers, "Created worker pool");
            WorkerPool {
                semaphore: Arc::new(Semaphore::new(workers)),
                size: workers,
                surplus: 0,
            }
        });
        if pool.size != workers {
            info!(environment, from = pool.size, to = workers, "Resizing worker pool");
            pool.resize(workers);
        }
        Arc::clone(&pool.semaphore)
    }

    /// Take one slot out of circulation if the pool is over its size.
    fn retire_slot(&self, environment: &str) -> bool {
        let mut pools = lock(&self.inner.pools);
        match pools.get_mut(environment) {
            Some(pool) if pool.surplus > 0 => {
                pool.surplus -= 1;
                true
            }
            _ => false,
        }
    }

    /// Run `work` in the background, holding `claim` until it finishes.
    pub fn spawn<F>(&self, claim: Claim, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.inner));
        debug!(key = %claim.key(), "Dispatching");

        tokio::spawn(async move {
            let _guard = guard;
            let _claim = claim;
            work.await;
        });
    }

    /// Run unkeyed side work, such as ticket comments, in the background.
    /// It counts towards [`wait_idle`](Self::wait_idle).
    pub fn spawn_background<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.inner));

        tokio::spawn(async move {
            let _guard = guard;
            work.await;
        });
    }

    /// Number of dispatched runs that have not finished.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once no dispatched work is left.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
