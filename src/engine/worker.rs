use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::domain::PileType;

use super::DispatchEngine;

/// The tight dispatch loop: on each tick, for each pile type in a
/// deterministic order, attempts one assignment (SPEC_FULL.md §4.1).
/// `start()` is idempotent; `stop(timeout)` signals shutdown and joins
/// within the timeout, mirroring `scheduler_core.start_dispatch_loop`/
/// `stop_dispatch_loop` and the teacher's `TaskScheduler` spawn pattern.
pub struct DispatchLoop {
    engine: Arc<DispatchEngine>,
    tick_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl DispatchLoop {
    pub fn new(engine: Arc<DispatchEngine>, tick_interval: Duration) -> Self {
        Self {
            engine,
            tick_interval,
            handle: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            debug!("dispatch loop already running, start() is a no-op");
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move { this.run().await }));
        info!(interval_ms = self.tick_interval.as_millis() as u64, "dispatch loop started");
    }

    async fn run(&self) {
        let mut ticker = interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for pile_type in PileType::all() {
                        if self.engine.assign_next(pile_type).is_some() {
                            debug!(?pile_type, "dispatched one request");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("dispatch loop received shutdown signal");
                    return;
                }
            }
        }
    }

    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.notify_one();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("dispatch loop did not stop within timeout");
            }
        }
    }
}
