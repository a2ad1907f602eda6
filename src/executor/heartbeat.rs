//! Periodic liveness and metrics reporting
//!
//! The heartbeat loop is its own tokio task. Task bodies run on the
//! blocking pool, so a stalled body cannot delay a heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{BlockStoreId, HeartbeatRequest, HeartbeatResponse};

use super::backend::ExecutorBackend;
use super::registry::TaskRegistry;

/// Delay before the first heartbeat, uniform in `[interval, 2 * interval)`.
///
/// Spreads the heartbeats of executors started at the same time.
pub fn initial_delay(interval: Duration) -> Duration {
    let nanos = interval.as_nanos().min(u64::MAX as u128 / 2) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(nanos..2 * nanos))
}

/// Builds and sends one heartbeat
struct Heartbeater {
    executor_id: String,
    block_store_id: BlockStoreId,
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn ExecutorBackend>,
    consecutive_failures: AtomicU64,
}

impl Heartbeater {
    async fn beat(&self) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            executor_id: self.executor_id.clone(),
            task_metrics: self.registry.running_snapshots(),
            block_store_id: self.block_store_id.clone(),
        };
        let running = request.task_metrics.len();

        match self.backend.heartbeat(request).await {
            Ok(response) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                debug!(running_tasks = running, "Heartbeat acknowledged");

                if response.reregister_block_manager {
                    info!(block_store = %self.block_store_id, "Told to re-register block store");
                    if let Err(e) = self.backend.register_block_store(&self.block_store_id).await {
                        warn!(error = %e, "Failed to re-register block store");
                    }
                }
                Ok(response)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, consecutive_failures = failures, "Issue communicating with coordinator");
                Err(e)
            }
        }
    }
}

struct HeartbeatWorker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Sends heartbeats on a fixed interval after a randomized initial delay
pub struct HeartbeatService {
    heartbeater: Arc<Heartbeater>,
    interval: Duration,
    worker: Mutex<Option<HeartbeatWorker>>,
}

impl HeartbeatService {
    pub fn new(
        executor_id: String,
        interval: Duration,
        block_store_id: BlockStoreId,
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn ExecutorBackend>,
    ) -> Self {
        Self {
            heartbeater: Arc::new(Heartbeater {
                executor_id,
                block_store_id,
                registry,
                backend,
                consecutive_failures: AtomicU64::new(0),
            }),
            interval: interval.max(Duration::from_millis(1)),
            worker: Mutex::new(None),
        }
    }

    /// Start the heartbeat loop. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(
            self.heartbeater.clone(),
            self.interval,
            shutdown_rx,
        ));
        *worker = Some(HeartbeatWorker { handle, shutdown });
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Send one heartbeat now
    pub async fn beat(&self) -> Result<HeartbeatResponse> {
        self.heartbeater.beat().await
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.heartbeater.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Stop the loop, waiting at most `timeout` for it to exit.
    ///
    /// Returns false if the loop had to be aborted.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return true;
        };

        let _ = worker.shutdown.send(true);
        match tokio::time::timeout(timeout, &mut worker.handle).await {
            Ok(_) => {
                debug!("Heartbeat loop stopped");
                true
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Heartbeat loop did not stop in time, aborting");
                worker.handle.abort();
                false
            }
        }
    }
}

async fn heartbeat_loop(
    heartbeater: Arc<Heartbeater>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let delay = initial_delay(interval);
    debug!(
        interval_ms = interval.as_millis() as u64,
        initial_delay_ms = delay.as_millis() as u64,
        "Heartbeat loop started"
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // failures are logged by beat and never stop the loop
                let _ = heartbeater.beat().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
