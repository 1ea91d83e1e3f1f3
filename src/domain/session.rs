use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Money, PileType, SessionStatus, TariffBucket};

/// An admitted, queued charge request. Immutable once enqueued in the engine
/// (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub req_id: String,
    pub queue_no: String,
    pub user_id: String,
    pub pile_type: PileType,
    pub kwh: f64,
    pub generated_at: DateTime<Utc>,
}

/// Result of a successful dispatch engine assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub req_id: String,
    pub pile_id: String,
    pub queue_no: String,
    pub start_time: DateTime<Utc>,
    pub estimated_end: DateTime<Utc>,
}

/// A lightweight record held in the per-mode station waiting lists
/// (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationWaitingEntry {
    pub session_id: String,
    pub user_id: String,
    pub mode: PileType,
    pub requested_kwh: f64,
    pub created_at: DateTime<Utc>,
}

/// The durable session record: the only thing the orchestrator writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub pile_id: Option<String>,
    pub queue_number: Option<String>,
    pub mode: PileType,
    pub requested_kwh: f64,
    pub actual_kwh: f64,
    pub duration_hours: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub charging_fee: Money,
    pub service_fee: Money,
    pub total_fee: Money,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, mode: PileType, requested_kwh: f64) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            pile_id: None,
            queue_number: None,
            mode,
            requested_kwh,
            actual_kwh: 0.0,
            duration_hours: 0.0,
            start_time: None,
            end_time: None,
            status: SessionStatus::StationWaiting,
            charging_fee: Money::zero(),
            service_fee: Money::zero(),
            total_fee: Money::zero(),
            created_at: now,
        }
    }

    /// SPEC_FULL.md §3 invariant: `actual_kwh ≤ requested_kwh`.
    pub fn actual_within_requested(&self) -> bool {
        self.actual_kwh <= self.requested_kwh + 1e-9
    }
}

/// Durable, queryable history row for a terminal session — distinct from the
/// live `Session` working row (SPEC_FULL.md §3, "Charging record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingRecord {
    pub session_id: String,
    pub user_id: String,
    pub pile_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub energy_kwh: f64,
    pub charging_fee: Money,
    pub service_fee: Money,
    pub total_fee: Money,
    pub single_bucket: Option<TariffBucket>,
    pub status: SessionStatus,
}

impl ChargingRecord {
    pub fn from_terminal_session(session: &Session, single_bucket: Option<TariffBucket>) -> Option<Self> {
        let start_time = session.start_time?;
        let end_time = session.end_time?;
        Some(Self {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            pile_id: session.pile_id.clone(),
            start_time,
            end_time,
            energy_kwh: session.actual_kwh,
            charging_fee: session.charging_fee,
            service_fee: session.service_fee,
            total_fee: session.total_fee,
            single_bucket,
            status: session.status,
        })
    }
}

/// Summary statistics over a filtered page of charging records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChargingRecordsSummary {
    pub total_records: u64,
    pub total_energy_kwh: f64,
    pub total_cost: f64,
}

/// A page of charging records plus the summary over the full filtered set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingRecordsPage {
    pub records: Vec<ChargingRecord>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub summary: ChargingRecordsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_station_waiting() {
        let s = Session::new("user-1", PileType::Fast, 15.0);
        assert_eq!(s.status, SessionStatus::StationWaiting);
        assert!(s.pile_id.is_none());
        assert!(s.actual_within_requested());
    }

    #[test]
    fn charging_record_requires_start_and_end() {
        let mut s = Session::new("user-1", PileType::Fast, 15.0);
        assert!(ChargingRecord::from_terminal_session(&s, None).is_none());
        s.start_time = Some(Utc::now());
        s.end_time = Some(Utc::now());
        s.actual_kwh = 15.0;
        let record = ChargingRecord::from_terminal_session(&s, Some(TariffBucket::Peak)).unwrap();
        assert_eq!(record.energy_kwh, 15.0);
        assert_eq!(record.single_bucket, Some(TariffBucket::Peak));
    }
}
