//! C5 — Recovery & Sync: startup reconciliation, the timeout sweeper, and
//! the engine↔store consistency sweep (SPEC_FULL.md §4.5). Grounded on
//! `examples/original_source/charging_service.py`'s startup recovery pass
//! and the teacher's `Database::connect_with_retry`/health-check shape for
//! "make the system consistent before serving traffic".

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{PileStatus, SessionStatus};

use super::SessionOrchestrator;

const TIMEOUT_SWEEP_LOCK_TTL: Duration = Duration::from_secs(15);

impl SessionOrchestrator {
    /// Runs once at startup (SPEC_FULL.md §4.5): registers the pile fleet
    /// into the engine, finalizes any session stuck `COMPLETING` across a
    /// restart, drops the (non-durable) station waiting lists, and then
    /// runs the consistency sweep.
    pub async fn startup_reconcile(&self) -> Result<()> {
        info!("starting recovery reconciliation");
        for pile in self.piles.list_all().await? {
            if pile.status == PileStatus::Offline {
                continue;
            }
            if let Err(e) = self.engine.register_pile(pile.clone()) {
                warn!(pile_id = %pile.pile_id, error = %e, "failed to register pile at startup");
            }
        }

        for mut session in self.sessions.find_by_status(SessionStatus::Completing).await? {
            let end = Utc::now();
            let start = session.start_time.unwrap_or(end);
            let fees = self.fee_breakdown(start, end, session.actual_kwh);
            session.end_time = Some(end);
            session.charging_fee = fees.charging_fee;
            session.service_fee = fees.service_fee;
            session.total_fee = fees.total_fee;
            session.status = SessionStatus::Completed;
            let pile_id = session.pile_id.take();
            self.sessions.update(&session).await?;
            if let Some(record) = crate::domain::ChargingRecord::from_terminal_session(&session, fees.single_bucket) {
                self.sessions.insert_charging_record(&record).await?;
            }
            self.cache.delete_session_status(&session.session_id).await;
            if let Some(pile_id) = pile_id {
                self.engine.end_charging(&pile_id);
            }
        }

        self.cache.clear_waiting().await;
        self.consistency_sweep().await?;
        info!("recovery reconciliation complete");
        Ok(())
    }

    /// Periodic worker (default 60 s): reclaims sessions stuck `COMPLETING`
    /// past `completing_timeout_s`, under the `timeout_check_lock` guard so
    /// only one sweeper runs at a time.
    pub async fn timeout_sweep(&self) -> Result<()> {
        if !self.cache.try_lock("timeout_check_lock", TIMEOUT_SWEEP_LOCK_TTL).await {
            return Ok(());
        }

        let timed_out = self
            .sessions
            .find_timed_out_completing(self.cfg.workers.completing_timeout_s as i64)
            .await?;
        for mut session in timed_out {
            // Re-check status defends against a race with the progress
            // monitor finishing the same session between the query above
            // and this write.
            let Some(current) = self.sessions.get(&session.session_id).await? else {
                continue;
            };
            if current.status != SessionStatus::Completing {
                continue;
            }

            let end = Utc::now();
            let start = session.start_time.unwrap_or(end);
            let fees = self.fee_breakdown(start, end, session.actual_kwh);
            session.end_time = Some(end);
            session.charging_fee = fees.charging_fee;
            session.service_fee = fees.service_fee;
            session.total_fee = fees.total_fee;
            session.status = SessionStatus::Completed;
            let pile_id = session.pile_id.take();
            self.sessions.update(&session).await?;
            if let Some(record) = crate::domain::ChargingRecord::from_terminal_session(&session, fees.single_bucket) {
                self.sessions.insert_charging_record(&record).await?;
            }
            self.cache.delete_session_status(&session.session_id).await;
            if let Some(pile_id) = pile_id {
                self.engine.end_charging(&pile_id);
                self.cache
                    .set_pile_status(&pile_id, crate::cache::PileStatusSnapshot { status: PileStatus::Idle, current_charging_session_id: None })
                    .await;
            }
            self.publish(
                crate::domain::OutboundEventType::ChargingCompletedRecovery,
                Some(session.user_id.clone()),
                serde_json::json!({"session_id": session.session_id}),
            );
            warn!(session_id = %session.session_id, "session reclaimed by timeout sweeper");
        }

        self.cache.unlock("timeout_check_lock").await;
        Ok(())
    }

    /// Engine↔store consistency sweep (SPEC_FULL.md §4.5): for every pile
    /// the engine reports `BUSY` with no matching `CHARGING` session, force
    /// `end_charging`; otherwise mirror the engine's idle state into the
    /// cache. Runs at startup and on `admin_force_sync`.
    pub async fn consistency_sweep(&self) -> Result<()> {
        for pile in self.engine.pile_snapshot() {
            if pile.status == PileStatus::Busy {
                let has_session = match &pile.current_req_id {
                    Some(req_id) => self.sessions.get(req_id).await?.map(|s| s.status) == Some(SessionStatus::Charging),
                    None => false,
                };
                if !has_session {
                    self.engine.end_charging(&pile.pile_id);
                    self.cache
                        .set_pile_status(&pile.pile_id, crate::cache::PileStatusSnapshot { status: PileStatus::Idle, current_charging_session_id: None })
                        .await;
                }
            } else if pile.status == PileStatus::Idle {
                self.cache
                    .set_pile_status(&pile.pile_id, crate::cache::PileStatusSnapshot { status: PileStatus::Idle, current_charging_session_id: None })
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::{AppConfig, DatabaseConfig, LogFormat, StationConfig, TariffConfig, TelemetryConfig, WorkerConfig};
    use crate::domain::{ChargeRequest, Pile, PileType, Session};
    use crate::engine::DispatchEngine;
    use crate::repo::{InMemoryPileRepository, InMemorySessionRepository, PileRepository, SessionRepository};
    use std::sync::Arc;

    fn test_config() -> AppConfig {
        AppConfig {
            station: StationConfig {
                waiting_area_capacity: 10,
                fast_pile_max_kw: 30.0,
                trickle_pile_max_kw: 7.0,
                fast_pile_count: 2,
                trickle_pile_count: 3,
                timezone: "UTC".to_string(),
                charging_speed_factor: 1.0,
                event_buffer_capacity: 100,
            },
            tariff: TariffConfig { peak_price: 1.0, normal_price: 0.7, valley_price: 0.4, service_price: 0.8 },
            workers: WorkerConfig {
                dispatch_interval_ms: 500,
                progress_interval_s: 10,
                promotion_interval_s: 5,
                timeout_sweep_interval_s: 60,
                completing_timeout_s: 60,
            },
            database: DatabaseConfig { url: "".to_string(), max_connections: 1, acquire_timeout_s: 1 },
            telemetry: TelemetryConfig { log_level: "info".to_string(), log_format: LogFormat::Pretty },
        }
    }

    #[tokio::test]
    async fn consistency_sweep_releases_busy_pile_with_no_matching_session() {
        let engine = Arc::new(DispatchEngine::new(100));
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        engine.enqueue(ChargeRequest {
            req_id: "orphan-req".to_string(),
            queue_no: "F00000000001".to_string(),
            user_id: "u1".to_string(),
            pile_type: PileType::Fast,
            kwh: 5.0,
            generated_at: Utc::now(),
        });
        engine.assign_next(PileType::Fast).unwrap();
        assert_eq!(engine.get_pile("A").unwrap().status, PileStatus::Busy);

        let orch = SessionOrchestrator::new(
            test_config(),
            engine.clone(),
            Arc::new(InMemorySessionRepository::new()),
            Arc::new(InMemoryPileRepository::new()),
            Arc::new(InMemoryCache::new()),
        );
        orch.consistency_sweep().await.unwrap();
        assert_eq!(engine.get_pile("A").unwrap().status, PileStatus::Idle);
    }

    #[tokio::test]
    async fn startup_reconcile_finalizes_stuck_completing_sessions() {
        let engine = Arc::new(DispatchEngine::new(100));
        let piles = Arc::new(InMemoryPileRepository::new());
        piles.upsert(&Pile::new("A", PileType::Fast, 30.0)).await.unwrap();
        let sessions = Arc::new(InMemorySessionRepository::new());

        let mut session = Session::new("u1", PileType::Fast, 5.0);
        session.status = SessionStatus::Completing;
        session.pile_id = Some("A".to_string());
        session.start_time = Some(Utc::now() - chrono::Duration::hours(1));
        session.actual_kwh = 5.0;
        sessions.insert(&session).await.unwrap();

        let orch = SessionOrchestrator::new(
            test_config(),
            engine,
            sessions.clone(),
            piles,
            Arc::new(InMemoryCache::new()),
        );
        orch.startup_reconcile().await.unwrap();

        let updated = sessions.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Completed);
        assert!(updated.end_time.is_some());
    }
}
