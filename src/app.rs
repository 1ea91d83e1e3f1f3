//! Application wiring: builds the dispatch engine, the repository/cache
//! backends selected by Cargo feature, and the session orchestrator, then
//! owns the periodic workers that drive them. Grounded on the teacher's
//! `controller::AppState::new`/`spawn_controller_tasks` split between
//! "construct the graph" and "start the background work".

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::cache::{CacheStore, InMemoryCache};
use crate::config::Config;
use crate::domain::PileType;
use crate::engine::worker::DispatchLoop;
use crate::engine::DispatchEngine;
use crate::orchestrator::worker::OrchestratorWorkers;
use crate::orchestrator::{build_pile_fleet, SessionOrchestrator};
use crate::repo::{InMemoryPileRepository, InMemorySessionRepository, PileRepository, SessionRepository};

#[cfg(feature = "db")]
use crate::repo::pg::PgRepo;

const EVENT_CAPACITY: usize = 4096;
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The fully wired system: one dispatch engine, one orchestrator, and the
/// background workers that drive both. Cheap to clone — everything inside
/// is an `Arc`.
#[derive(Clone)]
pub struct System {
    pub cfg: Config,
    pub engine: Arc<DispatchEngine>,
    pub orchestrator: Arc<SessionOrchestrator>,
    dispatch_loop: Arc<DispatchLoop>,
    orchestrator_workers: Arc<OrchestratorWorkers>,
}

impl System {
    /// Builds the pile fleet, engine, repositories (in-memory under `sim`,
    /// Postgres under `db`), cache, and orchestrator, but starts no
    /// background task yet — call [`System::spawn_workers`] once the
    /// caller is ready to begin serving.
    pub async fn new(cfg: Config) -> Result<Self> {
        let engine = Arc::new(DispatchEngine::new(EVENT_CAPACITY));

        let (sessions, piles): (Arc<dyn SessionRepository>, Arc<dyn PileRepository>) = Self::build_repos(&cfg).await?;
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());

        let fleet_ids = fleet_pile_ids(&cfg);
        for pile in build_pile_fleet(&cfg, &fleet_ids) {
            if piles.get(&pile.pile_id).await?.is_none() {
                piles.upsert(&pile).await?;
            }
        }

        let orchestrator = Arc::new(SessionOrchestrator::new(
            cfg.clone(),
            engine.clone(),
            sessions,
            piles,
            cache,
        ));
        orchestrator.startup_reconcile().await?;

        let dispatch_loop = Arc::new(DispatchLoop::new(
            engine.clone(),
            Duration::from_millis(cfg.workers.dispatch_interval_ms),
        ));
        let orchestrator_workers = Arc::new(OrchestratorWorkers::new(orchestrator.clone()));

        Ok(Self {
            cfg,
            engine,
            orchestrator,
            dispatch_loop,
            orchestrator_workers,
        })
    }

    #[cfg(not(feature = "db"))]
    async fn build_repos(_cfg: &Config) -> Result<(Arc<dyn SessionRepository>, Arc<dyn PileRepository>)> {
        info!("using in-memory session and pile repositories");
        Ok((
            Arc::new(InMemorySessionRepository::new()),
            Arc::new(InMemoryPileRepository::new()),
        ))
    }

    #[cfg(feature = "db")]
    async fn build_repos(cfg: &Config) -> Result<(Arc<dyn SessionRepository>, Arc<dyn PileRepository>)> {
        let repo = PgRepo::connect(
            &cfg.database.url,
            cfg.database.max_connections,
            Duration::from_secs(cfg.database.acquire_timeout_s),
        )
        .await?;
        Ok((Arc::new(repo.sessions()), Arc::new(repo.piles())))
    }

    /// Starts the dispatch loop and every orchestrator worker. Idempotent.
    pub async fn spawn_workers(&self) {
        self.dispatch_loop.start().await;
        self.orchestrator_workers.start().await;
        info!("all background workers started");
    }

    /// Signals every worker to stop and joins them within a fixed timeout,
    /// logging (but not failing) on stragglers.
    pub async fn shutdown(&self) {
        self.orchestrator_workers.stop(WORKER_STOP_TIMEOUT).await;
        self.dispatch_loop.stop(WORKER_STOP_TIMEOUT).await;
    }
}

/// Deterministic pile ids for the configured fleet sizes: `F01`, `F02`, ...
/// for fast piles and `T01`, `T02`, ... for trickle piles.
fn fleet_pile_ids(cfg: &Config) -> Vec<(String, PileType)> {
    let mut ids = Vec::with_capacity(cfg.station.fast_pile_count + cfg.station.trickle_pile_count);
    for i in 1..=cfg.station.fast_pile_count {
        ids.push((format!("F{:02}", i), PileType::Fast));
    }
    for i in 1..=cfg.station.trickle_pile_count {
        ids.push((format!("T{:02}", i), PileType::Trickle));
    }
    ids
}
