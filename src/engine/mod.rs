//! C1 — Dispatch Engine: in-memory typed FIFO queues, pile registry, and the
//! shortest-finish-time assignment algorithm (SPEC_FULL.md §4.1).
//!
//! Grounded on `examples/original_source/scheduler_core/core.py` and
//! `store.py` (the `_assign_lock`-guarded dicts/deques), expressed as a
//! single `parking_lot::Mutex`-guarded struct per the teacher's coarse-lock
//! style. The lock is held only for bounded computation, never across
//! `.await` — every method here is synchronous for exactly that reason.

pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::{ChargeRequest, DispatchResult, EngineEvent, Pile, PileStatus, PileType};
use crate::error::EngineError;

pub use worker::DispatchLoop;

struct EngineInner {
    queues: HashMap<PileType, VecDeque<ChargeRequest>>,
    piles: HashMap<String, Pile>,
    counters: HashMap<(String, PileType), u64>,
    events: VecDeque<EngineEvent>,
}

impl EngineInner {
    fn new() -> Self {
        let mut queues = HashMap::new();
        for t in PileType::all() {
            queues.insert(t, VecDeque::new());
        }
        Self {
            queues,
            piles: HashMap::new(),
            counters: HashMap::new(),
            events: VecDeque::new(),
        }
    }
}

pub struct DispatchEngine {
    inner: Mutex<EngineInner>,
    event_capacity: usize,
    running: AtomicBool,
}

impl DispatchEngine {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EngineInner::new()),
            event_capacity,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn push_event(&self, inner: &mut EngineInner, event: EngineEvent) {
        if inner.events.len() >= self.event_capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(event);
    }

    /// `<L><YYYYMMDD><NNNNNN>`: unique per `(calendar_date, type)`, the
    /// counter starting at 1 (SPEC_FULL.md §6).
    pub fn generate_queue_number(&self, pile_type: PileType) -> String {
        let mut inner = self.inner.lock();
        let date = Utc::now().format("%Y%m%d").to_string();
        let counter = inner
            .counters
            .entry((date.clone(), pile_type))
            .or_insert(0);
        *counter += 1;
        format!("{}{}{:06}", pile_type.type_letter(), date, counter)
    }

    pub fn enqueue(&self, req: ChargeRequest) {
        let mut inner = self.inner.lock();
        let pile_type = req.pile_type;
        inner.queues.entry(pile_type).or_default().push_back(req);
        self.push_event(&mut inner, EngineEvent::QueueUpdate { pile_type });
    }

    /// Deterministic choice for the "pile_id already present" case named in
    /// SPEC_FULL.md §4.1: reject rather than silently replace, so a caller
    /// never loses track of a pile it thought it was registering fresh.
    pub fn register_pile(&self, pile: Pile) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.piles.contains_key(&pile.pile_id) {
            return Err(EngineError::PileAlreadyRegistered(pile.pile_id));
        }
        inner.piles.insert(pile.pile_id.clone(), pile);
        Ok(())
    }

    /// `limit == 0` means "all" (SPEC_FULL.md §4.1's "limit ≤0 = all").
    pub fn peek_waiting(&self, pile_type: PileType, limit: usize) -> Vec<ChargeRequest> {
        let inner = self.inner.lock();
        let queue = inner.queues.get(&pile_type);
        match queue {
            None => Vec::new(),
            Some(q) => {
                let n = if limit == 0 { q.len() } else { limit.min(q.len()) };
                q.iter().take(n).cloned().collect()
            }
        }
    }

    fn eta_seconds(pile: &Pile, req: &ChargeRequest, now: DateTime<Utc>) -> f64 {
        let remained = pile
            .estimated_end
            .map(|end| (end - now).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let this_job = req.kwh / pile.max_kw * 3600.0;
        remained + this_job
    }

    /// Shortest-finish-time assignment for one pile type (SPEC_FULL.md
    /// §4.1). Returns `None` if the engine is stopped, the queue is empty,
    /// or no idle pile of that type exists.
    pub fn assign_next(&self, pile_type: PileType) -> Option<DispatchResult> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let mut inner = self.inner.lock();
        let queue = inner.queues.get(&pile_type)?;
        queue.front()?;

        let now = Utc::now();
        let chosen_id = {
            let mut candidates: Vec<&Pile> = inner
                .piles
                .values()
                .filter(|p| p.pile_type == pile_type && p.status == PileStatus::Idle)
                .collect();
            if candidates.is_empty() {
                return None;
            }
            candidates.sort_by(|a, b| a.pile_id.cmp(&b.pile_id));
            let req = inner.queues[&pile_type].front().unwrap();
            candidates
                .into_iter()
                .min_by(|a, b| {
                    Self::eta_seconds(a, req, now)
                        .partial_cmp(&Self::eta_seconds(b, req, now))
                        .unwrap()
                        .then_with(|| a.pile_id.cmp(&b.pile_id))
                })
                .map(|p| p.pile_id.clone())?
        };

        let req = inner.queues.get_mut(&pile_type).unwrap().pop_front().unwrap();
        let pile = inner.piles.get_mut(&chosen_id).unwrap();
        let finish = now + chrono::Duration::milliseconds((req.kwh / pile.max_kw * 3_600_000.0) as i64);
        pile.status = PileStatus::Busy;
        pile.current_req_id = Some(req.req_id.clone());
        pile.estimated_end = Some(finish);

        let result = DispatchResult {
            req_id: req.req_id,
            pile_id: chosen_id,
            queue_no: req.queue_no,
            start_time: now,
            estimated_end: finish,
        };
        self.push_event(&mut inner, EngineEvent::Dispatch(result.clone()));
        Some(result)
    }

    /// When the pile was `Busy`, rebuilds its in-flight request (preserving
    /// req_id/user_id/type, a fresh queue number, `kwh` as given by the
    /// caller) and re-enqueues it at the tail of its typed queue
    /// (SPEC_FULL.md §4.1's fault semantics).
    pub fn mark_fault(&self, pile_id: &str, requeue_kwh: f64) -> Result<(), EngineError> {
        let requeue = {
            let mut inner = self.inner.lock();
            let pile = inner
                .piles
                .get_mut(pile_id)
                .ok_or_else(|| EngineError::UnknownPile(pile_id.to_string()))?;
            pile.status = PileStatus::Fault;
            let requeue = pile.current_req_id.take().map(|req_id| {
                let pile_type = pile.pile_type;
                pile.estimated_end = None;
                (req_id, pile_type)
            });
            self.push_event(
                &mut inner,
                EngineEvent::PileFault {
                    pile_id: pile_id.to_string(),
                },
            );
            requeue
        };

        if let Some((req_id, pile_type)) = requeue {
            let queue_no = self.generate_queue_number(pile_type);
            self.enqueue(ChargeRequest {
                req_id,
                queue_no,
                user_id: "SYSTEM".to_string(),
                pile_type,
                kwh: requeue_kwh,
                generated_at: Utc::now(),
            });
        }
        Ok(())
    }

    pub fn recover_pile(&self, pile_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let pile = inner
            .piles
            .get_mut(pile_id)
            .ok_or_else(|| EngineError::UnknownPile(pile_id.to_string()))?;
        pile.status = PileStatus::Idle;
        self.push_event(
            &mut inner,
            EngineEvent::PileRecover {
                pile_id: pile_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn pause(&self, pile_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let pile = inner
            .piles
            .get_mut(pile_id)
            .ok_or_else(|| EngineError::UnknownPile(pile_id.to_string()))?;
        if pile.status != PileStatus::Busy {
            return Err(EngineError::PileNotBusy(pile_id.to_string()));
        }
        pile.status = PileStatus::Paused;
        self.push_event(
            &mut inner,
            EngineEvent::ChargingPaused {
                pile_id: pile_id.to_string(),
            },
        );
        Ok(())
    }

    /// `Busy`/`Paused` → `Idle`; clears the current request and
    /// `estimated_end`; emits `ChargingEnd` carrying the cleared req_id. A
    /// no-op (returns `None`) when the pile is not active.
    pub fn end_charging(&self, pile_id: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let pile = inner.piles.get_mut(pile_id)?;
        if !matches!(pile.status, PileStatus::Busy | PileStatus::Paused) {
            debug!(pile_id, "end_charging on inactive pile, no-op");
            return None;
        }
        let req_id = pile.current_req_id.take();
        pile.estimated_end = None;
        pile.status = PileStatus::Idle;
        self.push_event(
            &mut inner,
            EngineEvent::ChargingEnd {
                req_id: req_id.clone(),
                pile_id: pile_id.to_string(),
            },
        );
        req_id
    }

    pub fn set_offline(&self, pile_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let pile = inner
            .piles
            .get_mut(pile_id)
            .ok_or_else(|| EngineError::UnknownPile(pile_id.to_string()))?;
        pile.status = PileStatus::Offline;
        Ok(())
    }

    pub fn set_online(&self, pile_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let pile = inner
            .piles
            .get_mut(pile_id)
            .ok_or_else(|| EngineError::UnknownPile(pile_id.to_string()))?;
        if pile.status == PileStatus::Offline {
            pile.status = PileStatus::Idle;
        } else {
            warn!(pile_id, ?pile.status, "set_online on a pile that was not offline");
        }
        Ok(())
    }

    pub fn pile_snapshot(&self) -> Vec<Pile> {
        self.inner.lock().piles.values().cloned().collect()
    }

    pub fn get_pile(&self, pile_id: &str) -> Option<Pile> {
        self.inner.lock().piles.get(pile_id).cloned()
    }

    pub fn queue_depths(&self) -> HashMap<PileType, usize> {
        self.inner
            .lock()
            .queues
            .iter()
            .map(|(t, q)| (*t, q.len()))
            .collect()
    }

    pub fn pop_events(&self) -> Vec<EngineEvent> {
        let mut inner = self.inner.lock();
        inner.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(pile_type: PileType, kwh: f64) -> ChargeRequest {
        ChargeRequest {
            req_id: uuid::Uuid::new_v4().to_string(),
            queue_no: "F00000000001".to_string(),
            user_id: "u1".to_string(),
            pile_type,
            kwh,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn queue_numbers_are_monotonic_per_type() {
        let engine = DispatchEngine::new(100);
        let n1 = engine.generate_queue_number(PileType::Fast);
        let n2 = engine.generate_queue_number(PileType::Fast);
        let n3 = engine.generate_queue_number(PileType::Trickle);
        assert!(n1.starts_with('F'));
        assert!(n2 > n1);
        assert!(n3.starts_with('T'));
    }

    #[test]
    fn assign_next_picks_idle_pile_with_lowest_eta() {
        let engine = DispatchEngine::new(100);
        engine.register_pile(Pile::new("B", PileType::Fast, 30.0)).unwrap();
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        engine.enqueue(req(PileType::Fast, 15.0));

        let result = engine.assign_next(PileType::Fast).unwrap();
        // Both idle with equal ETA: lexicographic tie-break picks "A".
        assert_eq!(result.pile_id, "A");
        assert!(engine.assign_next(PileType::Fast).is_none());
    }

    #[test]
    fn assign_next_returns_none_when_stopped() {
        let engine = DispatchEngine::new(100);
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        engine.enqueue(req(PileType::Fast, 15.0));
        engine.stop();
        assert!(engine.assign_next(PileType::Fast).is_none());
    }

    #[test]
    fn mark_fault_requeues_in_flight_request() {
        let engine = DispatchEngine::new(100);
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        engine.enqueue(req(PileType::Fast, 10.0));
        engine.assign_next(PileType::Fast).unwrap();

        engine.mark_fault("A", 0.0).unwrap();
        assert_eq!(engine.get_pile("A").unwrap().status, PileStatus::Fault);
        assert_eq!(engine.queue_depths()[&PileType::Fast], 1);
    }

    #[test]
    fn end_charging_is_noop_on_idle_pile() {
        let engine = DispatchEngine::new(100);
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        assert!(engine.end_charging("A").is_none());
    }

    #[test]
    fn register_pile_rejects_duplicate_id() {
        let engine = DispatchEngine::new(100);
        engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
        let err = engine.register_pile(Pile::new("A", PileType::Fast, 7.0)).unwrap_err();
        assert_eq!(err, EngineError::PileAlreadyRegistered("A".to_string()));
    }

    #[test]
    fn event_buffer_drops_oldest_when_full() {
        let engine = DispatchEngine::new(2);
        engine.enqueue(req(PileType::Fast, 1.0));
        engine.enqueue(req(PileType::Trickle, 1.0));
        engine.enqueue(req(PileType::Fast, 2.0));
        let events = engine.pop_events();
        assert_eq!(events.len(), 2);
    }
}
