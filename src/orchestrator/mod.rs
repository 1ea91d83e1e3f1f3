//! C2 — Session Orchestrator: owns the durable session state machine, is
//! the only component that writes session rows, and consumes dispatch
//! engine events (SPEC_FULL.md §4.2). Grounded on
//! `examples/original_source/charging_service.py`'s handler methods,
//! restructured around a `tokio::sync::Mutex` serializing the
//! read-decide-write sequence the teacher's HTTP handlers do under a
//! per-request `RwLock<AppState>` borrow.

pub mod billing;
pub mod progress;
pub mod recovery;
pub mod station;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, PileStatusSnapshot, SessionStatusSnapshot};
use crate::config::Config;
use crate::domain::{
    EngineEvent, OutboundEvent, OutboundEventType, Pile, PileStatus, PileType, Session,
    SessionStatus,
};
use crate::engine::DispatchEngine;
use crate::error::OperationError;
use crate::repo::{PileRepository, SessionRepository};

/// Everything the orchestrator needs to serve user-facing operations and
/// process engine events. Cloned cheaply (all fields are `Arc`s) so each
/// periodic worker and the binary's call sites can hold their own handle.
#[derive(Clone)]
pub struct SessionOrchestrator {
    cfg: Config,
    engine: Arc<DispatchEngine>,
    sessions: Arc<dyn SessionRepository>,
    piles: Arc<dyn PileRepository>,
    cache: Arc<dyn CacheStore>,
    events_out: broadcast::Sender<OutboundEvent>,
    lock: Arc<Mutex<()>>,
}

impl SessionOrchestrator {
    pub fn new(
        cfg: Config,
        engine: Arc<DispatchEngine>,
        sessions: Arc<dyn SessionRepository>,
        piles: Arc<dyn PileRepository>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let (events_out, _) = broadcast::channel(256);
        Self {
            cfg,
            engine,
            sessions,
            piles,
            cache,
            events_out,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events_out.subscribe()
    }

    fn publish(&self, event_type: OutboundEventType, target_user_id: Option<String>, payload: serde_json::Value) {
        let event = OutboundEvent::new(event_type, target_user_id, payload);
        // Lagging subscribers drop the oldest unseen event rather than block us.
        let _ = self.events_out.send(event);
    }

    fn fee_breakdown(&self, start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>, actual_kwh: f64) -> billing::FeeBreakdown {
        billing::compute_fees(start, end, actual_kwh, &self.cfg.tariff, &self.cfg.station.timezone)
    }

    // ---- user-facing operations (SPEC_FULL.md §4.2) ----------------------

    pub async fn submit(&self, user_id: &str, mode: PileType, kwh: f64) -> Result<String> {
        if kwh <= 0.0 {
            return Err(OperationError::NonPositiveKwh.into());
        }
        let _guard = self.lock.lock().await;

        if self.sessions.find_active_for_user(user_id).await?.is_some() {
            return Err(OperationError::UserHasActiveSession.into());
        }
        if self.cache.combined_waiting_len().await >= self.cfg.station.waiting_area_capacity {
            return Err(OperationError::WaitingAreaFull.into());
        }

        let session = Session::new(user_id, mode, kwh);
        self.sessions.insert(&session).await.context("persisting new session")?;
        self.cache
            .push_waiting(
                mode,
                crate::domain::StationWaitingEntry {
                    session_id: session.session_id.clone(),
                    user_id: user_id.to_string(),
                    mode,
                    requested_kwh: kwh,
                    created_at: session.created_at,
                },
            )
            .await;
        self.cache
            .set_session_status(
                &session.session_id,
                SessionStatusSnapshot {
                    status: SessionStatus::StationWaiting,
                    pile_id: None,
                    queue_number: None,
                    actual_kwh: 0.0,
                },
            )
            .await;

        info!(session_id = %session.session_id, %user_id, ?mode, kwh, "session submitted, station-waiting");
        self.publish(
            OutboundEventType::RequestSubmittedStation,
            Some(user_id.to_string()),
            serde_json::json!({"session_id": session.session_id}),
        );
        Ok(session.session_id)
    }

    pub async fn modify(&self, session_id: &str, user_id: &str, new_mode: Option<PileType>, new_kwh: Option<f64>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| OperationError::UnknownSession(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(OperationError::NotOwner.into());
        }
        if session.status != SessionStatus::StationWaiting {
            return Err(OperationError::ModeChangeNotPermitted.into());
        }
        // Mode changes are out of scope (DESIGN.md open question #2):
        // cancel and resubmit with the new mode instead.
        if new_mode.is_some() {
            return Err(OperationError::ModeChangeNotPermitted.into());
        }
        if let Some(kwh) = new_kwh {
            if kwh <= 0.0 {
                return Err(OperationError::NonPositiveKwh.into());
            }
            session.requested_kwh = kwh;
        }
        self.sessions.update(&session).await.context("persisting session modification")?;
        Ok(())
    }

    pub async fn cancel(&self, session_id: &str, user_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| OperationError::UnknownSession(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(OperationError::NotOwner.into());
        }

        match session.status {
            SessionStatus::StationWaiting => {
                session.status = SessionStatus::Cancelled;
                session.end_time = Some(Utc::now());
                self.sessions.update(&session).await?;
                self.cache.delete_session_status(session_id).await;
                self.cache.remove_waiting(session.mode, session_id).await;
            }
            SessionStatus::EngineQueued => {
                // The engine has no queue-removal operation; mark intent and
                // let the eventual dispatch finalize as cancelled.
                session.status = SessionStatus::CancellingAfterDispatch;
                self.sessions.update(&session).await?;
            }
            SessionStatus::Charging => {
                if let Some(pile_id) = &session.pile_id {
                    self.engine.end_charging(pile_id);
                }
                // Stays CHARGING until `charging_end` finalizes it as CANCELLED.
            }
            SessionStatus::Completing => {
                let end = Utc::now();
                let start = session.start_time.unwrap_or(end);
                let fees = self.fee_breakdown(start, end, session.actual_kwh);
                session.end_time = Some(end);
                session.charging_fee = fees.charging_fee;
                session.service_fee = fees.service_fee;
                session.total_fee = fees.total_fee;
                session.status = SessionStatus::Cancelled;
                self.sessions.update(&session).await?;
                if let Some(pile_id) = session.pile_id.take() {
                    self.engine.end_charging(&pile_id);
                }
                self.cache.delete_session_status(session_id).await;
            }
            terminal if terminal.is_terminal() => {
                return Err(OperationError::AlreadyTerminal.into());
            }
            _ => unreachable!("exhaustive over SessionStatus variants"),
        }

        self.publish(
            OutboundEventType::RequestCancelled,
            Some(user_id.to_string()),
            serde_json::json!({"session_id": session_id}),
        );
        Ok(())
    }

    pub async fn stop_charging(&self, session_id: &str, user_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| OperationError::UnknownSession(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(OperationError::NotOwner.into());
        }
        if !matches!(session.status, SessionStatus::Charging | SessionStatus::Completing) {
            return Err(OperationError::ModeChangeNotPermitted.into());
        }
        if let Some(pile_id) = &session.pile_id {
            self.engine.end_charging(pile_id);
        }
        Ok(())
    }

    pub async fn query_user_status(&self, user_id: &str) -> Result<Option<UserStatusSnapshot>> {
        let Some(session) = self.sessions.find_active_for_user(user_id).await? else {
            return Ok(None);
        };
        let position = match session.status {
            SessionStatus::StationWaiting => self.cache.waiting_rank(session.mode, &session.session_id).await,
            SessionStatus::EngineQueued => self.engine.peek_waiting(session.mode, 0).iter().position(|r| {
                session.queue_number.as_deref() == Some(r.queue_no.as_str())
            }),
            _ => None,
        };
        Ok(Some(UserStatusSnapshot { session, queue_position: position }))
    }

    pub async fn list_charging_records(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
        from: Option<chrono::DateTime<Utc>>,
        to: Option<chrono::DateTime<Utc>>,
    ) -> Result<crate::domain::ChargingRecordsPage> {
        let (records, total) = self.sessions.list_charging_records(user_id, page, per_page, from, to).await?;
        let summary = records.iter().fold(crate::domain::ChargingRecordsSummary::default(), |mut acc, r| {
            acc.total_records += 1;
            acc.total_energy_kwh += r.energy_kwh;
            acc.total_cost += r.total_fee.as_f64();
            acc
        });
        Ok(crate::domain::ChargingRecordsPage { records, page, per_page, total, summary })
    }

    pub async fn admin_start_pile(&self, pile_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.engine.set_online(pile_id)?;
        if let Some(mut pile) = self.piles.get(pile_id).await? {
            pile.status = PileStatus::Idle;
            self.piles.upsert(&pile).await?;
        }
        Ok(())
    }

    pub async fn admin_stop_pile(&self, pile_id: &str, force: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let active = self
            .sessions
            .find_unique_by_pile_and_statuses(pile_id, &[SessionStatus::Charging, SessionStatus::Completing])
            .await?;
        if let Some(mut session) = active {
            if !force {
                return Err(OperationError::PileHasActiveSessionsNotForce.into());
            }
            // Open-question decision (SPEC_FULL.md §9): deliberate admin
            // force-stop finalizes as CANCELLED, reusing the cancellation
            // finalization path rather than FAULT_COMPLETED.
            let end = Utc::now();
            let start = session.start_time.unwrap_or(end);
            let fees = self.fee_breakdown(start, end, session.actual_kwh);
            session.end_time = Some(end);
            session.charging_fee = fees.charging_fee;
            session.service_fee = fees.service_fee;
            session.total_fee = fees.total_fee;
            session.status = SessionStatus::Cancelled;
            self.sessions.update(&session).await?;
            self.cache.delete_session_status(&session.session_id).await;
        }
        self.engine.set_offline(pile_id)?;
        if let Some(mut pile) = self.piles.get(pile_id).await? {
            pile.status = PileStatus::Offline;
            self.piles.upsert(&pile).await?;
        }
        Ok(())
    }

    pub async fn admin_force_sync(&self) -> Result<()> {
        self.consistency_sweep().await
    }

    // ---- engine event handlers (SPEC_FULL.md §4.2) ------------------------

    pub async fn handle_dispatch(&self, result: &crate::domain::DispatchResult) -> Result<()> {
        let _guard = self.lock.lock().await;
        let Some(mut session) = self.find_session_by_req_id(&result.req_id).await? else {
            warn!(req_id = %result.req_id, "dispatch event for unknown session");
            return Ok(());
        };

        if session.status == SessionStatus::CancellingAfterDispatch {
            self.engine.end_charging(&result.pile_id);
            return Ok(());
        }

        session.pile_id = Some(result.pile_id.clone());
        session.start_time = Some(result.start_time);
        session.actual_kwh = 0.0;
        session.duration_hours = 0.0;
        session.status = SessionStatus::Charging;
        self.sessions.update(&session).await?;
        self.cache
            .set_session_status(
                &session.session_id,
                SessionStatusSnapshot {
                    status: SessionStatus::Charging,
                    pile_id: Some(result.pile_id.clone()),
                    queue_number: Some(result.queue_no.clone()),
                    actual_kwh: 0.0,
                },
            )
            .await;
        self.cache
            .set_pile_status(
                &result.pile_id,
                PileStatusSnapshot { status: PileStatus::Busy, current_charging_session_id: Some(session.session_id.clone()) },
            )
            .await;
        self.publish(
            OutboundEventType::ChargingStarted,
            Some(session.user_id.clone()),
            serde_json::json!({"session_id": session.session_id, "pile_id": result.pile_id}),
        );
        Ok(())
    }

    pub async fn handle_charging_end(&self, req_id: Option<&str>, pile_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let found = match req_id {
            Some(id) => self.find_session_by_req_id(id).await?,
            None => {
                self.sessions
                    .find_unique_by_pile_and_statuses(pile_id, &[SessionStatus::Charging, SessionStatus::Completing])
                    .await?
            }
        };

        let Some(mut session) = found else {
            debug!(pile_id, "charging_end with no matching session, releasing pile in cache only");
            self.cache
                .set_pile_status(pile_id, PileStatusSnapshot { status: PileStatus::Idle, current_charging_session_id: None })
                .await;
            return Ok(());
        };

        let end = Utc::now();
        let start = session.start_time.unwrap_or(end);
        let fees = self.fee_breakdown(start, end, session.actual_kwh);
        session.end_time = Some(end);
        session.charging_fee = fees.charging_fee;
        session.service_fee = fees.service_fee;
        session.total_fee = fees.total_fee;
        session.status = match session.status {
            SessionStatus::CancellingAfterDispatch => SessionStatus::Cancelled,
            _ => SessionStatus::Completed,
        };
        self.sessions.update(&session).await?;

        if let Some(record) = crate::domain::ChargingRecord::from_terminal_session(&session, fees.single_bucket) {
            self.sessions.insert_charging_record(&record).await?;
        }
        if let Some(mut pile) = self.piles.get(pile_id).await? {
            pile.stats.record_terminal_session(crate::domain::Kwh::new(session.actual_kwh), session.total_fee);
            pile.status = PileStatus::Idle;
            self.piles.upsert(&pile).await?;
        }
        self.cache.delete_session_status(&session.session_id).await;
        self.cache
            .set_pile_status(pile_id, PileStatusSnapshot { status: PileStatus::Idle, current_charging_session_id: None })
            .await;

        let event_type = if session.status == SessionStatus::Cancelled {
            OutboundEventType::RequestCancelled
        } else {
            OutboundEventType::ChargingEnded
        };
        self.publish(event_type, Some(session.user_id.clone()), serde_json::json!({"session_id": session.session_id}));

        let mode = session.mode;
        drop(_guard);
        self.promote_one(mode).await?;
        Ok(())
    }

    pub async fn handle_pile_fault(&self, pile_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(mut pile) = self.piles.get(pile_id).await? {
            pile.status = PileStatus::Fault;
            self.piles.upsert(&pile).await?;
        }

        let Some(mut session) = self
            .sessions
            .find_unique_by_pile_and_statuses(pile_id, &[SessionStatus::Charging])
            .await?
        else {
            return Ok(());
        };

        let end = Utc::now();
        let start = session.start_time.unwrap_or(end);
        let fees = self.fee_breakdown(start, end, session.actual_kwh);
        session.end_time = Some(end);
        session.charging_fee = fees.charging_fee;
        session.service_fee = fees.service_fee;
        session.total_fee = fees.total_fee;
        session.status = SessionStatus::FaultCompleted;
        session.pile_id = None;
        self.sessions.update(&session).await?;
        self.cache.delete_session_status(&session.session_id).await;

        self.publish(
            OutboundEventType::SessionFaultStopped,
            Some(session.user_id.clone()),
            serde_json::json!({"session_id": session.session_id, "pile_id": pile_id}),
        );
        Ok(())
    }

    pub async fn handle_pile_recover(&self, pile_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(mut pile) = self.piles.get(pile_id).await? {
            pile.status = PileStatus::Idle;
            self.piles.upsert(&pile).await?;
        }
        drop(_guard);
        self.promote_one(PileType::Fast).await?;
        self.promote_one(PileType::Trickle).await?;
        Ok(())
    }

    pub async fn handle_charging_paused(&self, pile_id: &str) -> Result<()> {
        if let Some(snapshot) = self.cache.get_pile_status(pile_id).await {
            if let Some(session_id) = snapshot.current_charging_session_id {
                if let Some(session) = self.sessions.get(&session_id).await? {
                    self.publish(
                        OutboundEventType::ChargingPaused,
                        Some(session.user_id),
                        serde_json::json!({"session_id": session_id, "pile_id": pile_id}),
                    );
                }
            }
        }
        Ok(())
    }

    /// Drains and dispatches every engine event currently buffered. Called
    /// by the event-drain worker (SPEC_FULL.md §5, 2 s cadence).
    pub async fn drain_engine_events(&self) -> Result<()> {
        for event in self.engine.pop_events() {
            let result = match &event {
                EngineEvent::QueueUpdate { .. } => Ok(()),
                EngineEvent::Dispatch(r) => self.handle_dispatch(r).await,
                EngineEvent::ChargingEnd { req_id, pile_id } => {
                    self.handle_charging_end(req_id.as_deref(), pile_id).await
                }
                EngineEvent::PileFault { pile_id } => self.handle_pile_fault(pile_id).await,
                EngineEvent::PileRecover { pile_id } => self.handle_pile_recover(pile_id).await,
                EngineEvent::ChargingPaused { pile_id } => self.handle_charging_paused(pile_id).await,
            };
            if let Err(e) = result {
                warn!(error = %e, ?event, "event handler failed, continuing drain");
            }
        }
        Ok(())
    }

    async fn find_session_by_req_id(&self, req_id: &str) -> Result<Option<Session>> {
        // req_id and session_id are the same identifier end to end in this
        // crate (SPEC_FULL.md §3): a ChargeRequest is always built from an
        // already-persisted Session.
        self.sessions.get(req_id).await
    }
}

#[derive(Debug, Clone)]
pub struct UserStatusSnapshot {
    pub session: Session,
    pub queue_position: Option<usize>,
}

/// Registers the configured pile fleet into the engine (called once at
/// startup by the binary, SPEC_FULL.md §2 "Binary composition").
pub fn build_pile_fleet(cfg: &Config, ids: &[(String, PileType)]) -> Vec<Pile> {
    ids.iter()
        .map(|(id, pile_type)| {
            let max_kw = match pile_type {
                PileType::Fast => cfg.station.fast_pile_max_kw,
                PileType::Trickle => cfg.station.trickle_pile_max_kw,
            };
            Pile::new(id.clone(), *pile_type, max_kw)
        })
        .collect()
}
