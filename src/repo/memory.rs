//! Default in-memory repository, used when the `db` feature is off. Good
//! enough for a single-process deployment (SPEC_FULL.md §1 Non-goals) and
//! for tests that would otherwise need a database.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{ChargingRecord, Pile, Session, SessionStatus};

use super::{ExpectedStatus, PileRepository, SessionRepository};

#[derive(Default)]
struct SessionInner {
    sessions: HashMap<String, Session>,
    records: Vec<ChargingRecord>,
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    inner: RwLock<SessionInner>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn update(&self, session: &Session) -> Result<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn compare_and_update(&self, session: &Session, expected: ExpectedStatus) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get(&session.session_id) {
            Some(current) if current.status == expected.0 => {
                inner.sessions.insert(session.session_id.clone(), session.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_active_for_user(&self, user_id: &str) -> Result<Option<Session>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.user_id == user_id && !s.status.is_terminal())
            .cloned())
    }

    async fn find_unique_by_pile_and_statuses(
        &self,
        pile_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Option<Session>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.pile_id.as_deref() == Some(pile_id) && statuses.contains(&s.status))
            .cloned())
    }

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn find_timed_out_completing(&self, older_than_seconds: i64) -> Result<Vec<Session>> {
        let now = Utc::now();
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Completing
                    && s.start_time
                        .map(|t| (now - t).num_seconds() > older_than_seconds)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_charging_record(&self, record: &ChargingRecord) -> Result<()> {
        self.inner.write().await.records.push(record.clone());
        Ok(())
    }

    async fn list_charging_records(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<(Vec<ChargingRecord>, u64)> {
        let inner = self.inner.read().await;
        let mut matching: Vec<ChargingRecord> = inner
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter(|r| from.map(|f| r.start_time >= f).unwrap_or(true))
            .filter(|r| to.map(|t| r.end_time <= t).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let total = matching.len() as u64;
        let start = (page.saturating_sub(1) as usize) * per_page as usize;
        let page_slice = matching.into_iter().skip(start).take(per_page as usize).collect();
        Ok((page_slice, total))
    }
}

#[derive(Default)]
pub struct InMemoryPileRepository {
    inner: RwLock<HashMap<String, Pile>>,
}

impl InMemoryPileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PileRepository for InMemoryPileRepository {
    async fn upsert(&self, pile: &Pile) -> Result<()> {
        self.inner.write().await.insert(pile.pile_id.clone(), pile.clone());
        Ok(())
    }

    async fn get(&self, pile_id: &str) -> Result<Option<Pile>> {
        Ok(self.inner.read().await.get(pile_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Pile>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PileStatus, PileType};

    #[tokio::test]
    async fn compare_and_update_rejects_stale_expected_status() {
        let repo = InMemorySessionRepository::new();
        let session = Session::new("u1", PileType::Fast, 10.0);
        repo.insert(&session).await.unwrap();

        let mut updated = session.clone();
        updated.status = SessionStatus::Cancelled;
        let ok = repo
            .compare_and_update(&updated, ExpectedStatus(SessionStatus::Charging))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(repo.get(&session.session_id).await.unwrap().unwrap().status, SessionStatus::StationWaiting);
    }

    #[tokio::test]
    async fn find_active_for_user_ignores_terminal_sessions() {
        let repo = InMemorySessionRepository::new();
        let mut session = Session::new("u1", PileType::Fast, 10.0);
        session.status = SessionStatus::Cancelled;
        repo.insert(&session).await.unwrap();
        assert!(repo.find_active_for_user("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pile_repository_roundtrips() {
        let repo = InMemoryPileRepository::new();
        let pile = Pile::new("A", PileType::Fast, 30.0);
        repo.upsert(&pile).await.unwrap();
        let fetched = repo.get("A").await.unwrap().unwrap();
        assert_eq!(fetched.status, PileStatus::Idle);
    }
}
