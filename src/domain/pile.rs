use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Kwh, Money, PileStatus, PileType};

/// A physical charging point. Mutated only by the dispatch engine under its
/// assignment lock (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pile {
    pub pile_id: String,
    pub pile_type: PileType,
    pub max_kw: f64,
    pub status: PileStatus,
    pub current_req_id: Option<String>,
    pub estimated_end: Option<DateTime<Utc>>,
    pub stats: PileStats,
}

impl Pile {
    pub fn new(pile_id: impl Into<String>, pile_type: PileType, max_kw: f64) -> Self {
        Self {
            pile_id: pile_id.into(),
            pile_type,
            max_kw,
            status: PileStatus::Idle,
            current_req_id: None,
            estimated_end: None,
            stats: PileStats::default(),
        }
    }

    /// Invariant from SPEC_FULL.md §3: `current_req_id` is set iff status is
    /// `Busy` or `Paused`.
    pub fn invariant_holds(&self) -> bool {
        let active = matches!(self.status, PileStatus::Busy | PileStatus::Paused);
        self.current_req_id.is_some() == active
    }
}

/// Lifetime pile statistics. Incremented only on terminal session
/// transitions; never decremented.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PileStats {
    pub lifetime_sessions: u64,
    pub lifetime_energy_kwh: f64,
    pub lifetime_revenue: f64,
}

impl PileStats {
    pub fn record_terminal_session(&mut self, energy: Kwh, revenue: Money) {
        self.lifetime_sessions += 1;
        self.lifetime_energy_kwh += energy.0;
        self.lifetime_revenue += revenue.as_f64();
    }
}
