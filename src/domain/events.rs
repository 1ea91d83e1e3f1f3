use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::DispatchResult;

/// Events produced by the dispatch engine under `engine_lock`, carrying a
/// monotonic production order (SPEC_FULL.md §5). Drained FIFO by the
/// orchestrator's event-drain worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    QueueUpdate {
        pile_type: super::types::PileType,
    },
    Dispatch(DispatchResult),
    ChargingEnd {
        req_id: Option<String>,
        pile_id: String,
    },
    PileFault {
        pile_id: String,
    },
    PileRecover {
        pile_id: String,
    },
    ChargingPaused {
        pile_id: String,
    },
}

/// Outbound event envelope published to the notifier collaborator
/// (SPEC_FULL.md §6). Realized in this crate as a `tokio::sync::broadcast`
/// publisher; a transport adapter would subscribe to forward these out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event_type: OutboundEventType,
    pub timestamp: DateTime<Utc>,
    pub target_user_id: Option<String>,
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(
        event_type: OutboundEventType,
        target_user_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            target_user_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundEventType {
    RequestSubmittedStation,
    RequestQueuedEngine,
    ChargingStarted,
    ChargingEnded,
    ChargingPaused,
    SessionFaultStopped,
    RequestCancelled,
    ChargingCompletedRecovery,
    StatusUpdate,
}
