//! C4 — Progress monitor: periodically advances `actual_kwh` for charging
//! sessions and claims the completion-once guard when a session reaches its
//! requested energy (SPEC_FULL.md §4.4). Grounded on
//! `examples/original_source/charging_service.py`'s progress-polling loop.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error};

use crate::domain::SessionStatus;
use crate::repo::ExpectedStatus;

use super::SessionOrchestrator;

const COMPLETING_GUARD_TTL: Duration = Duration::from_secs(30);
const FORCE_COMPLETE_MARKER_TTL: Duration = Duration::from_secs(60);

impl SessionOrchestrator {
    /// One pass over every `CHARGING` session (SPEC_FULL.md §4.4). Never
    /// resurrects a terminal session: every write is a compare-and-set
    /// conditional on the session still being `CHARGING`.
    pub async fn progress_tick(&self) -> Result<()> {
        for session in self.sessions.find_by_status(SessionStatus::Charging).await? {
            if let Err(e) = self.advance_one(session).await {
                error!(error = %e, "progress tick failed for one session, continuing");
            }
        }
        Ok(())
    }

    async fn advance_one(&self, mut session: crate::domain::Session) -> Result<()> {
        let Some(pile_id) = session.pile_id.clone() else {
            return Ok(());
        };
        let Some(pile) = self.engine.get_pile(&pile_id) else {
            return Ok(());
        };
        let Some(start_time) = session.start_time else {
            return Ok(());
        };

        let now = Utc::now();
        let elapsed_h = (now - start_time).num_milliseconds().max(0) as f64 / 1000.0 / 3600.0;
        let potential_kwh = elapsed_h * pile.max_kw * self.cfg.station.charging_speed_factor;
        let new_actual = (potential_kwh.min(session.requested_kwh) * 10_000.0).round() / 10_000.0;

        if new_actual > session.actual_kwh {
            let expected = ExpectedStatus(SessionStatus::Charging);
            let mut updated = session.clone();
            updated.actual_kwh = new_actual;
            updated.duration_hours = (now - start_time).num_milliseconds().max(0) as f64 / 1000.0 / 3600.0;
            if self.sessions.compare_and_update(&updated, expected).await? {
                session = updated;
            } else {
                debug!(session_id = %session.session_id, "progress write lost the race, session moved on");
                return Ok(());
            }
        }

        if session.actual_kwh >= session.requested_kwh {
            self.try_complete(session, pile_id).await?;
        }
        Ok(())
    }

    async fn try_complete(&self, mut session: crate::domain::Session, pile_id: String) -> Result<()> {
        let guard_key = format!("completing:{}", session.session_id);
        if !self.cache.try_lock(&guard_key, COMPLETING_GUARD_TTL).await {
            return Ok(());
        }

        let expected = ExpectedStatus(SessionStatus::Charging);
        session.status = SessionStatus::Completing;
        if !self.sessions.compare_and_update(&session, expected).await? {
            // Someone else already moved this session on; release the guard.
            self.cache.unlock(&guard_key).await;
            return Ok(());
        }

        if self.engine.end_charging(&pile_id).is_none() {
            // Engine disagreed about pile state; let the recovery sweeper
            // reclaim this session rather than leaving it stuck.
            let marker_key = format!("force_complete:{}", session.session_id);
            let _ = self.cache.try_lock(&marker_key, FORCE_COMPLETE_MARKER_TTL).await;
        }
        Ok(())
    }
}
