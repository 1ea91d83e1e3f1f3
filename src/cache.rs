//! Ephemeral key/value cache: station waiting lists, live session/pile
//! status snapshots, and the named `SET NX EX` locks from SPEC_FULL.md §5.
//!
//! Grounded on `scheduler_core/store.py`'s lock-guarded dicts/deques,
//! generalized to the key layout in SPEC_FULL.md §6. The default
//! implementation is in-process (`InMemoryCache`); a real deployment would
//! swap in a Redis-backed implementation behind the same trait without the
//! orchestrator noticing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{PileStatus, PileType, SessionStatus, StationWaitingEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusSnapshot {
    pub status: SessionStatus,
    pub pile_id: Option<String>,
    pub queue_number: Option<String>,
    pub actual_kwh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PileStatusSnapshot {
    pub status: PileStatus,
    pub current_charging_session_id: Option<String>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomic `SET NX EX`: returns `true` if the caller won the lock.
    async fn try_lock(&self, key: &str, ttl: Duration) -> bool;
    async fn unlock(&self, key: &str);

    async fn set_session_status(&self, session_id: &str, snapshot: SessionStatusSnapshot);
    async fn get_session_status(&self, session_id: &str) -> Option<SessionStatusSnapshot>;
    async fn delete_session_status(&self, session_id: &str);

    async fn set_pile_status(&self, pile_id: &str, snapshot: PileStatusSnapshot);
    async fn get_pile_status(&self, pile_id: &str) -> Option<PileStatusSnapshot>;

    async fn push_waiting(&self, mode: PileType, entry: StationWaitingEntry);
    async fn pop_waiting(&self, mode: PileType) -> Option<StationWaitingEntry>;

    /// Removes the entry for `session_id` from `mode`'s waiting deque,
    /// wherever it sits (SPEC_FULL.md's cancellation table: a `STATION_WAITING`
    /// cancel must remove it from the list, not just leave it for `promote_one`
    /// to lazily discard). No-op if the entry isn't present.
    async fn remove_waiting(&self, mode: PileType, session_id: &str);

    /// 0-based rank of `session_id` within `mode`'s waiting deque, or `None`
    /// if it isn't waiting in that mode.
    async fn waiting_rank(&self, mode: PileType, session_id: &str) -> Option<usize>;

    async fn waiting_len(&self, mode: PileType) -> usize;
    async fn combined_waiting_len(&self) -> usize {
        let mut total = 0;
        for mode in PileType::all() {
            total += self.waiting_len(mode).await;
        }
        total
    }
    async fn clear_waiting(&self);
}

struct CacheInner {
    locks: HashMap<String, Instant>,
    session_status: HashMap<String, SessionStatusSnapshot>,
    pile_status: HashMap<String, PileStatusSnapshot>,
    waiting: HashMap<PileType, VecDeque<StationWaitingEntry>>,
}

impl Default for CacheInner {
    fn default() -> Self {
        let mut waiting = HashMap::new();
        for mode in PileType::all() {
            waiting.insert(mode, VecDeque::new());
        }
        Self {
            locks: HashMap::new(),
            session_status: HashMap::new(),
            pile_status: HashMap::new(),
            waiting,
        }
    }
}

/// Default in-process cache. Good enough for a single engine instance, which
/// is all this core ever assumes (SPEC_FULL.md §1 Non-goals).
pub struct InMemoryCache {
    inner: Mutex<CacheInner>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn try_lock(&self, key: &str, ttl: Duration) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(expires_at) = inner.locks.get(key) {
            if *expires_at > now {
                return false;
            }
        }
        inner.locks.insert(key.to_string(), now + ttl);
        true
    }

    async fn unlock(&self, key: &str) {
        self.inner.lock().locks.remove(key);
    }

    async fn set_session_status(&self, session_id: &str, snapshot: SessionStatusSnapshot) {
        self.inner
            .lock()
            .session_status
            .insert(session_id.to_string(), snapshot);
    }

    async fn get_session_status(&self, session_id: &str) -> Option<SessionStatusSnapshot> {
        self.inner.lock().session_status.get(session_id).cloned()
    }

    async fn delete_session_status(&self, session_id: &str) {
        self.inner.lock().session_status.remove(session_id);
    }

    async fn set_pile_status(&self, pile_id: &str, snapshot: PileStatusSnapshot) {
        self.inner
            .lock()
            .pile_status
            .insert(pile_id.to_string(), snapshot);
    }

    async fn get_pile_status(&self, pile_id: &str) -> Option<PileStatusSnapshot> {
        self.inner.lock().pile_status.get(pile_id).cloned()
    }

    async fn push_waiting(&self, mode: PileType, entry: StationWaitingEntry) {
        self.inner.lock().waiting.entry(mode).or_default().push_back(entry);
    }

    async fn pop_waiting(&self, mode: PileType) -> Option<StationWaitingEntry> {
        self.inner.lock().waiting.get_mut(&mode)?.pop_front()
    }

    async fn remove_waiting(&self, mode: PileType, session_id: &str) {
        if let Some(queue) = self.inner.lock().waiting.get_mut(&mode) {
            queue.retain(|e| e.session_id != session_id);
        }
    }

    async fn waiting_rank(&self, mode: PileType, session_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .waiting
            .get(&mode)?
            .iter()
            .position(|e| e.session_id == session_id)
    }

    async fn waiting_len(&self, mode: PileType) -> usize {
        self.inner
            .lock()
            .waiting
            .get(&mode)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    async fn clear_waiting(&self) {
        for queue in self.inner.lock().waiting.values_mut() {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_ttl_expires() {
        let cache = InMemoryCache::new();
        assert!(cache.try_lock("timeout_check_lock", Duration::from_millis(30)).await);
        assert!(!cache.try_lock("timeout_check_lock", Duration::from_millis(30)).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.try_lock("timeout_check_lock", Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn unlock_releases_immediately() {
        let cache = InMemoryCache::new();
        assert!(cache.try_lock("broadcast_lock", Duration::from_secs(1)).await);
        cache.unlock("broadcast_lock").await;
        assert!(cache.try_lock("broadcast_lock", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn waiting_lists_are_fifo_per_mode() {
        let cache = InMemoryCache::new();
        let entry = |id: &str| StationWaitingEntry {
            session_id: id.to_string(),
            user_id: "u".to_string(),
            mode: PileType::Fast,
            requested_kwh: 1.0,
            created_at: chrono::Utc::now(),
        };
        cache.push_waiting(PileType::Fast, entry("s1")).await;
        cache.push_waiting(PileType::Fast, entry("s2")).await;
        assert_eq!(cache.waiting_len(PileType::Fast).await, 2);
        let first = cache.pop_waiting(PileType::Fast).await.unwrap();
        assert_eq!(first.session_id, "s1");
        assert_eq!(cache.combined_waiting_len().await, 1);
    }

    #[tokio::test]
    async fn remove_waiting_drops_a_non_front_entry() {
        let cache = InMemoryCache::new();
        let entry = |id: &str| StationWaitingEntry {
            session_id: id.to_string(),
            user_id: "u".to_string(),
            mode: PileType::Fast,
            requested_kwh: 1.0,
            created_at: chrono::Utc::now(),
        };
        cache.push_waiting(PileType::Fast, entry("s1")).await;
        cache.push_waiting(PileType::Fast, entry("s2")).await;
        cache.push_waiting(PileType::Fast, entry("s3")).await;

        cache.remove_waiting(PileType::Fast, "s2").await;

        assert_eq!(cache.waiting_len(PileType::Fast).await, 2);
        assert_eq!(cache.waiting_rank(PileType::Fast, "s2").await, None);
        assert_eq!(cache.waiting_rank(PileType::Fast, "s3").await, Some(1));
    }

    #[tokio::test]
    async fn waiting_rank_reflects_fifo_position() {
        let cache = InMemoryCache::new();
        let entry = |id: &str| StationWaitingEntry {
            session_id: id.to_string(),
            user_id: "u".to_string(),
            mode: PileType::Fast,
            requested_kwh: 1.0,
            created_at: chrono::Utc::now(),
        };
        cache.push_waiting(PileType::Fast, entry("s1")).await;
        cache.push_waiting(PileType::Fast, entry("s2")).await;

        assert_eq!(cache.waiting_rank(PileType::Fast, "s1").await, Some(0));
        assert_eq!(cache.waiting_rank(PileType::Fast, "s2").await, Some(1));
        assert_eq!(cache.waiting_rank(PileType::Fast, "missing").await, None);
    }
}
