//! C3 — Station Admission: per-mode FIFO waiting lists and the one-pop-per-
//! tick promotion worker (SPEC_FULL.md §4.3). Grounded on
//! `examples/original_source/charging_service.py`'s
//! `process_station_waiting_area_to_engine`.

use anyhow::Result;
use tracing::debug;

use crate::cache::SessionStatusSnapshot;
use crate::domain::{ChargeRequest, PileType, SessionStatus};

use super::SessionOrchestrator;

impl SessionOrchestrator {
    /// Pops at most one station-waiting entry for `mode` and promotes it
    /// into the dispatch engine. A no-op if the list is empty or the
    /// session it names is no longer `STATION_WAITING` (e.g. cancelled
    /// while queued).
    pub async fn promote_one(&self, mode: PileType) -> Result<()> {
        let Some(entry) = self.cache.pop_waiting(mode).await else {
            return Ok(());
        };

        let Some(mut session) = self.sessions.get(&entry.session_id).await? else {
            debug!(session_id = %entry.session_id, "promotion target vanished, discarding");
            return Ok(());
        };
        if session.status != SessionStatus::StationWaiting {
            debug!(session_id = %entry.session_id, ?session.status, "promotion target no longer waiting, discarding");
            return Ok(());
        }

        let queue_no = self.engine.generate_queue_number(mode);
        self.engine.enqueue(ChargeRequest {
            req_id: session.session_id.clone(),
            queue_no: queue_no.clone(),
            user_id: session.user_id.clone(),
            pile_type: mode,
            kwh: session.requested_kwh,
            generated_at: chrono::Utc::now(),
        });

        session.status = SessionStatus::EngineQueued;
        session.queue_number = Some(queue_no.clone());
        self.sessions.update(&session).await?;
        self.cache
            .set_session_status(
                &session.session_id,
                SessionStatusSnapshot {
                    status: SessionStatus::EngineQueued,
                    pile_id: None,
                    queue_number: Some(queue_no),
                    actual_kwh: 0.0,
                },
            )
            .await;
        self.publish(
            crate::domain::OutboundEventType::RequestQueuedEngine,
            Some(session.user_id.clone()),
            serde_json::json!({"session_id": session.session_id}),
        );
        Ok(())
    }

    /// One promotion pass across every pile type, called by the promotion
    /// worker each tick (default 5 s cadence).
    pub async fn promote_all_modes(&self) -> Result<()> {
        for mode in PileType::all() {
            self.promote_one(mode).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::{DatabaseConfig, StationConfig, TariffConfig, TelemetryConfig, WorkerConfig};
    use crate::domain::{Pile, Session};
    use crate::engine::DispatchEngine;
    use crate::repo::{InMemoryPileRepository, InMemorySessionRepository};
    use std::sync::Arc;

    fn test_config() -> crate::config::Config {
        crate::config::AppConfig {
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
            telemetry: TelemetryConfig { log_level: "info".to_string(), log_format: crate::config::LogFormat::Pretty },
        }
    }

    fn orchestrator() -> SessionOrchestrator {
        let engine = Arc::new(DispatchEngine::new(100));
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        SessionOrchestrator::new(
            test_config(),
            engine,
            Arc::new(InMemorySessionRepository::new()),
            Arc::new(InMemoryPileRepository::new()),
            Arc::new(InMemoryCache::new()),
        )
    }

    #[tokio::test]
    async fn promote_one_is_noop_on_empty_list() {
        let orch = orchestrator();
        orch.promote_one(PileType::Fast).await.unwrap();
    }

    #[tokio::test]
    async fn promote_one_discards_cancelled_session() {
        let orch = orchestrator();
        let mut session = Session::new("u1", PileType::Fast, 10.0);
        session.status = SessionStatus::Cancelled;
        orch.sessions.insert(&session).await.unwrap();
        orch.cache
            .push_waiting(
                PileType::Fast,
                crate::domain::StationWaitingEntry {
                    session_id: session.session_id.clone(),
                    user_id: "u1".to_string(),
                    mode: PileType::Fast,
                    requested_kwh: 10.0,
                    created_at: chrono::Utc::now(),
                },
            )
            .await;
        orch.promote_one(PileType::Fast).await.unwrap();
        assert_eq!(orch.engine.queue_depths()[&PileType::Fast], 0);
    }

    #[tokio::test]
    async fn promote_one_queues_waiting_session() {
        let orch = orchestrator();
        let session = Session::new("u1", PileType::Fast, 10.0);
        orch.sessions.insert(&session).await.unwrap();
        orch.cache
            .push_waiting(
                PileType::Fast,
                crate::domain::StationWaitingEntry {
                    session_id: session.session_id.clone(),
                    user_id: "u1".to_string(),
                    mode: PileType::Fast,
                    requested_kwh: 10.0,
                    created_at: chrono::Utc::now(),
                },
            )
            .await;
        orch.promote_one(PileType::Fast).await.unwrap();
        assert_eq!(orch.engine.queue_depths()[&PileType::Fast], 1);
        let updated = orch.sessions.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::EngineQueued);
    }
}
