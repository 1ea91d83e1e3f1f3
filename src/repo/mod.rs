//! Durable session/pile repository trait plus the default in-memory
//! implementation. The `db` feature swaps in `pg` (sqlx/Postgres), mirroring
//! how the teacher's `Repositories` wraps one pool behind per-table
//! repository structs (`repo/devices.rs`).

pub mod memory;

#[cfg(feature = "db")]
pub mod pg;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{ChargingRecord, Pile, Session, SessionStatus};

/// A narrow conditional-update predicate: only apply the write if the
/// session's current status matches. Mirrors §4.2's "read → decide → write"
/// rule and §4.4's "conditional update on status is mandatory".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedStatus(pub SessionStatus);

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Unconditional overwrite, used by handlers that already hold the
    /// orchestrator lock and have just re-read the row.
    async fn update(&self, session: &Session) -> Result<()>;

    /// Overwrite only if the persisted row's status still equals
    /// `expected`. Returns `Ok(false)` — not an error — when the compare
    /// fails (SPEC_FULL.md §7: "Inconsistency ... is the expected
    /// `Ok(false)`/`None` return of a conditional write").
    async fn compare_and_update(&self, session: &Session, expected: ExpectedStatus) -> Result<bool>;

    async fn find_active_for_user(&self, user_id: &str) -> Result<Option<Session>>;
    async fn find_unique_by_pile_and_statuses(
        &self,
        pile_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Option<Session>>;
    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>>;
    async fn find_timed_out_completing(
        &self,
        older_than_seconds: i64,
    ) -> Result<Vec<Session>>;

    async fn insert_charging_record(&self, record: &ChargingRecord) -> Result<()>;
    async fn list_charging_records(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
        from: Option<chrono::DateTime<chrono::Utc>>,
        to: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(Vec<ChargingRecord>, u64)>;
}

#[async_trait]
pub trait PileRepository: Send + Sync {
    async fn upsert(&self, pile: &Pile) -> Result<()>;
    async fn get(&self, pile_id: &str) -> Result<Option<Pile>>;
    async fn list_all(&self) -> Result<Vec<Pile>>;
}

pub use memory::{InMemoryPileRepository, InMemorySessionRepository};
