//! Periodic workers that drive the orchestrator without any caller polling
//! it (SPEC_FULL.md §4.1/§4.3/§4.4/§4.5): event drain, station promotion,
//! progress monitoring, and the timeout sweeper. Same `Notify` + stored
//! `JoinHandle` idiom as [`crate::engine::worker::DispatchLoop`], extended
//! to manage several independently-paced tasks under one `start`/`stop`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::SessionOrchestrator;

const EVENT_DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on the random initial delay before a worker's first tick, so
/// the four workers don't all wake on the same instant (SPEC_FULL.md §4.5:
/// the promotion worker must be "jittered to avoid lockstep with other
/// workers"). Capped well below any configured worker interval.
const MAX_STARTUP_JITTER: Duration = Duration::from_millis(500);

/// Owns the background tasks that keep a [`SessionOrchestrator`] moving:
/// draining engine events, promoting station-waiting sessions, advancing
/// charging progress, and sweeping timed-out completions. `start()` is
/// idempotent; `stop(timeout)` signals every task and joins them all.
pub struct OrchestratorWorkers {
    orch: Arc<SessionOrchestrator>,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
    shutdown: Arc<Notify>,
}

impl OrchestratorWorkers {
    pub fn new(orch: Arc<SessionOrchestrator>) -> Self {
        Self {
            orch,
            handles: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.handles.lock().await;
        if guard.is_some() {
            return;
        }

        let mut handles = Vec::with_capacity(4);
        handles.push(self.spawn_job("event-drain", EVENT_DRAIN_INTERVAL, |orch| async move {
            orch.drain_engine_events().await
        }));
        handles.push(self.spawn_job(
            "station-promotion",
            Duration::from_secs(self.orch_cfg().promotion_interval_s),
            |orch| async move { orch.promote_all_modes().await },
        ));
        handles.push(self.spawn_job(
            "progress-monitor",
            Duration::from_secs(self.orch_cfg().progress_interval_s),
            |orch| async move { orch.progress_tick().await },
        ));
        handles.push(self.spawn_job(
            "timeout-sweep",
            Duration::from_secs(self.orch_cfg().timeout_sweep_interval_s),
            |orch| async move { orch.timeout_sweep().await },
        ));

        info!("orchestrator workers started");
        *guard = Some(handles);
    }

    fn orch_cfg(&self) -> crate::config::WorkerConfig {
        self.orch.cfg.workers.clone()
    }

    fn spawn_job<F, Fut>(&self, name: &'static str, tick: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<SessionOrchestrator>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        let orch = self.orch.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let jitter_ms = rand::thread_rng().gen_range(0..=MAX_STARTUP_JITTER.as_millis() as u64);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                _ = shutdown.notified() => {
                    info!(worker = name, "periodic worker received shutdown signal during startup jitter");
                    return;
                }
            }

            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job(orch.clone()).await {
                            error!(worker = name, error = %e, "periodic worker pass failed, continuing");
                        }
                    }
                    _ = shutdown.notified() => {
                        info!(worker = name, "periodic worker received shutdown signal");
                        return;
                    }
                }
            }
        })
    }

    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.notify_waiters();
        let handles = self.handles.lock().await.take();
        if let Some(handles) = handles {
            for handle in handles {
                if tokio::time::timeout(timeout, handle).await.is_err() {
                    warn!("an orchestrator worker did not stop within timeout");
                }
            }
        }
    }
}
