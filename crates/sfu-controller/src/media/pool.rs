//! `WorkerPool` - fixed set of media workers handed out round-robin.
//!
//! The pool watches every worker. A worker that stops while the pool is not
//! shutting down is a fatal failure: the pool records it once and resolves
//! [`WorkerPool::fatal_failure`], which the binary turns into a process exit.
//! Rooms on the dead worker are not migrated.

use super::local::{LocalWorker, WorkerSettings};
use super::worker::MediaWorker;
use crate::errors::SfuError;
use crate::observability::metrics;

use common::types::WorkerId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct PooledWorker {
    worker: Arc<dyn MediaWorker>,
    dead: Arc<AtomicBool>,
}

/// First fatal failure, shared with the monitor tasks.
#[derive(Default)]
struct FatalState {
    token: CancellationToken,
    failure: OnceLock<SfuError>,
}

/// Pool of media workers.
pub struct WorkerPool {
    workers: Vec<PooledWorker>,
    cursor: AtomicUsize,
    shutting_down: Arc<AtomicBool>,
    alive: Arc<AtomicUsize>,
    fatal: Arc<FatalState>,
}

impl WorkerPool {
    /// Build a pool over already-running workers and start monitoring them.
    #[must_use]
    pub fn new(workers: Vec<Arc<dyn MediaWorker>>) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicUsize::new(workers.len()));
        let fatal = Arc::new(FatalState::default());
        metrics::set_workers_alive(workers.len());

        let workers = workers
            .into_iter()
            .map(|worker| {
                let dead = Arc::new(AtomicBool::new(false));
                tokio::spawn(monitor_worker(
                    Arc::clone(&worker),
                    Arc::clone(&dead),
                    Arc::clone(&shutting_down),
                    Arc::clone(&alive),
                    Arc::clone(&fatal),
                ));
                PooledWorker { worker, dead }
            })
            .collect();

        Self {
            workers,
            cursor: AtomicUsize::new(0),
            shutting_down,
            alive,
            fatal,
        }
    }

    /// Spawn `num_workers` in-process workers over disjoint port slices.
    ///
    /// Workers only stop through [`WorkerPool::shutdown`]; they do not follow
    /// the service cancellation token, so any earlier exit is fatal.
    pub fn spawn_local(num_workers: usize, settings: &WorkerSettings) -> Result<Self, SfuError> {
        let slices = settings.partition(num_workers);
        if num_workers == 0 || slices.len() < num_workers {
            return Err(SfuError::Config(format!(
                "cannot split ports {}-{} across {num_workers} workers",
                settings.min_port, settings.max_port
            )));
        }

        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(num_workers);
        for (index, slice) in slices.into_iter().enumerate() {
            let id = u32::try_from(index)
                .map_err(|_| SfuError::Config("too many workers".to_string()))?;
            workers.push(Arc::new(LocalWorker::spawn(
                WorkerId(id),
                slice,
                CancellationToken::new(),
            )));
        }

        info!(
            target: "sfu.media.pool",
            workers = workers.len(),
            min_port = settings.min_port,
            max_port = settings.max_port,
            "Media worker pool started"
        );

        Ok(Self::new(workers))
    }

    /// Next live worker in round-robin order.
    pub fn acquire_worker(&self) -> Result<Arc<dyn MediaWorker>, SfuError> {
        if self.workers.is_empty() {
            return Err(SfuError::Resource("no media workers configured".to_string()));
        }
        if let Some(failure) = self.fatal.failure.get() {
            return Err(failure.clone());
        }

        for _ in 0..self.workers.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            if let Some(pooled) = self.workers.get(index) {
                if !pooled.dead.load(Ordering::Acquire) {
                    return Ok(Arc::clone(&pooled.worker));
                }
            }
        }

        Err(SfuError::Resource("no live media workers".to_string()))
    }

    /// Resolves with the first fatal worker failure.
    pub async fn fatal_failure(&self) -> SfuError {
        self.fatal.token.cancelled().await;
        self.fatal
            .failure
            .get()
            .cloned()
            .unwrap_or_else(|| SfuError::Internal("worker failure not recorded".to_string()))
    }

    /// The fatal failure, if one happened.
    #[must_use]
    pub fn failure(&self) -> Option<SfuError> {
        self.fatal.failure.get().cloned()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Close every worker. Worker exits after this point are not fatal.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!(
            target: "sfu.media.pool",
            workers = self.workers.len(),
            "Closing media workers"
        );
        for pooled in &self.workers {
            pooled.worker.close().await;
        }
    }
}

async fn monitor_worker(
    worker: Arc<dyn MediaWorker>,
    dead: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    alive: Arc<AtomicUsize>,
    fatal: Arc<FatalState>,
) {
    let exit = worker.closed().await;
    dead.store(true, Ordering::Release);
    let remaining = alive.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
    metrics::set_workers_alive(remaining);

    if shutting_down.load(Ordering::Acquire) {
        info!(
            target: "sfu.media.pool",
            worker_id = %worker.id(),
            reason = %exit.reason,
            "Media worker closed"
        );
        return;
    }

    error!(
        target: "sfu.media.pool",
        worker_id = %worker.id(),
        reason = %exit.reason,
        graceful = exit.graceful,
        workers_alive = remaining,
        "Media worker died"
    );
    metrics::record_worker_death();

    let recorded = fatal
        .failure
        .set(SfuError::FatalWorker {
            worker_id: worker.id(),
            reason: exit.reason,
        })
        .is_ok();
    if !recorded {
        warn!(
            target: "sfu.media.pool",
            worker_id = %worker.id(),
            "Additional media worker died after fatal failure"
        );
    }
    fatal.token.cancel();
}
