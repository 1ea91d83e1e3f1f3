//! End-to-end dispatch scenarios, grounded in SPEC_FULL.md §8's concrete
//! examples. These drive the orchestrator and engine directly — there is
//! no transport layer in this crate (SPEC_FULL.md §2) — and assert on the
//! durable session state rather than on fees computed against the live
//! wall clock, since §4.4's tariff buckets are keyed on local time of day
//! and `Utc::now()` is not something a test controls.

use std::sync::Arc;

use chrono::Utc;

use charge_dispatch_core::cache::InMemoryCache;
use charge_dispatch_core::config::{
    AppConfig, DatabaseConfig, LogFormat, StationConfig, TariffConfig, TelemetryConfig, WorkerConfig,
};
use charge_dispatch_core::domain::{Pile, PileStatus, PileType, SessionStatus};
use charge_dispatch_core::engine::DispatchEngine;
use charge_dispatch_core::orchestrator::SessionOrchestrator;
use charge_dispatch_core::repo::{InMemoryPileRepository, InMemorySessionRepository, SessionRepository};

fn config(waiting_area_capacity: usize) -> AppConfig {
    AppConfig {
        station: StationConfig {
            waiting_area_capacity,
            fast_pile_max_kw: 30.0,
            trickle_pile_max_kw: 7.0,
            fast_pile_count: 2,
            trickle_pile_count: 3,
            timezone: "UTC".to_string(),
            charging_speed_factor: 1.0,
            event_buffer_capacity: 100,
        },
        tariff: TariffConfig {
            peak_price: 1.00,
            normal_price: 0.70,
            valley_price: 0.40,
            service_price: 0.80,
        },
        workers: WorkerConfig {
            dispatch_interval_ms: 100,
            progress_interval_s: 1,
            promotion_interval_s: 1,
            timeout_sweep_interval_s: 60,
            completing_timeout_s: 60,
        },
        database: DatabaseConfig { url: String::new(), max_connections: 1, acquire_timeout_s: 1 },
        telemetry: TelemetryConfig { log_level: "error".to_string(), log_format: LogFormat::Pretty },
    }
}

fn harness(waiting_area_capacity: usize) -> (Arc<DispatchEngine>, SessionOrchestrator, Arc<InMemorySessionRepository>) {
    let engine = Arc::new(DispatchEngine::new(256));
    let sessions = Arc::new(InMemorySessionRepository::new());
    let orch = SessionOrchestrator::new(
        config(waiting_area_capacity),
        engine.clone(),
        sessions.clone(),
        Arc::new(InMemoryPileRepository::new()),
        Arc::new(InMemoryCache::new()),
    );
    (engine, orch, sessions)
}

/// Scenario 1 — happy path, fast charge: a lone request on an idle pile
/// goes station-waiting → engine-queued → charging → completed, and its
/// final fee is internally consistent (charging_fee + service_fee =
/// total_fee, with service_fee = actual_kwh * service_price).
#[tokio::test]
async fn happy_path_fast_charge_reaches_completed_with_consistent_fees() {
    let (engine, orch, sessions) = harness(10);
    engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();

    let session_id = orch.submit("user-1", PileType::Fast, 15.0).await.unwrap();
    assert_eq!(
        sessions.get(&session_id).await.unwrap().unwrap().status,
        SessionStatus::StationWaiting
    );

    orch.promote_one(PileType::Fast).await.unwrap();
    let dispatch = engine.assign_next(PileType::Fast).unwrap();
    orch.handle_dispatch(&dispatch).await.unwrap();

    let mut charging = sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(charging.status, SessionStatus::Charging);
    charging.actual_kwh = 15.0;
    sessions.update(&charging).await.unwrap();

    orch.handle_charging_end(Some(&session_id), "A").await.unwrap();

    let done = sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.actual_kwh, 15.0);
    assert_eq!(done.total_fee.as_f64(), done.charging_fee.as_f64() + done.service_fee.as_f64());
    assert!((done.service_fee.as_f64() - 15.0 * 0.80).abs() < 1e-6);
    assert_eq!(engine.get_pile("A").unwrap().status, PileStatus::Idle);
}

/// Scenario 2 — shortest finish time: two idle same-type piles, two
/// back-to-back requests of different size, each assigned to a distinct
/// pile with neither left queued.
#[tokio::test]
async fn shortest_finish_time_assigns_each_request_a_distinct_pile() {
    let (engine, orch, _sessions) = harness(10);
    engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
    engine.register_pile(Pile::new("B", PileType::Fast, 30.0)).unwrap();

    let r1 = orch.submit("user-1", PileType::Fast, 10.0).await.unwrap();
    let r2 = orch.submit("user-2", PileType::Fast, 5.0).await.unwrap();

    orch.promote_one(PileType::Fast).await.unwrap();
    orch.promote_one(PileType::Fast).await.unwrap();

    let first = engine.assign_next(PileType::Fast).unwrap();
    let second = engine.assign_next(PileType::Fast).unwrap();

    assert_eq!(first.req_id, r1);
    assert_eq!(first.pile_id, "A");
    assert_eq!(second.req_id, r2);
    assert_eq!(second.pile_id, "B");
    assert!(engine.assign_next(PileType::Fast).is_none());
}

/// Scenario 3 — cancel from the engine queue: cancelling while
/// `ENGINE_QUEUED` with the assigned pile offline defers finalization
/// until dispatch actually fires, then lands on `CANCELLED` with zero
/// energy billed.
#[tokio::test]
async fn cancel_after_dispatch_finalizes_as_cancelled_with_zero_fee() {
    let (engine, orch, sessions) = harness(10);
    engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();
    engine.set_offline("A").unwrap();

    let session_id = orch.submit("user-1", PileType::Fast, 20.0).await.unwrap();
    orch.promote_one(PileType::Fast).await.unwrap();
    assert_eq!(
        sessions.get(&session_id).await.unwrap().unwrap().status,
        SessionStatus::EngineQueued
    );

    orch.cancel(&session_id, "user-1").await.unwrap();
    assert_eq!(
        sessions.get(&session_id).await.unwrap().unwrap().status,
        SessionStatus::CancellingAfterDispatch
    );

    engine.set_online("A").unwrap();
    let dispatch = engine.assign_next(PileType::Fast).unwrap();
    orch.handle_dispatch(&dispatch).await.unwrap();
    orch.drain_engine_events().await.unwrap();

    let terminal = sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(terminal.status, SessionStatus::Cancelled);
    assert_eq!(terminal.actual_kwh, 0.0);
    assert_eq!(terminal.total_fee.as_f64(), 0.0);
}

/// Scenario 4 — fault mid-charge: a pile fault while a session is
/// `CHARGING` finalizes that session as `FAULT_COMPLETED` with whatever
/// energy had actually been delivered, and clears its pile assignment.
#[tokio::test]
async fn pile_fault_mid_charge_finalizes_as_fault_completed() {
    let (engine, orch, sessions) = harness(10);
    engine.register_pile(Pile::new("A", PileType::Fast, 30.0)).unwrap();

    let session_id = orch.submit("user-1", PileType::Fast, 30.0).await.unwrap();
    orch.promote_one(PileType::Fast).await.unwrap();
    let dispatch = engine.assign_next(PileType::Fast).unwrap();
    orch.handle_dispatch(&dispatch).await.unwrap();

    let mut charging = sessions.get(&session_id).await.unwrap().unwrap();
    charging.actual_kwh = 5.0;
    sessions.update(&charging).await.unwrap();

    orch.handle_pile_fault("A").await.unwrap();

    let faulted = sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(faulted.status, SessionStatus::FaultCompleted);
    assert_eq!(faulted.actual_kwh, 5.0);
    assert!(faulted.pile_id.is_none());
    assert_eq!(engine.get_pile("A").unwrap().status, PileStatus::Fault);
}

/// Scenario 5 — tariff crossing: the pure fee function splits a window
/// spanning a tariff boundary proportionally by time, not by the bucket
/// the session started in.
#[test]
fn tariff_crossing_splits_fee_by_segment() {
    use chrono::TimeZone;
    let tariff = TariffConfig { peak_price: 1.00, normal_price: 0.70, valley_price: 0.40, service_price: 0.80 };
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2026, 1, 1, 11, 30, 0).unwrap();

    let fees = charge_dispatch_core::orchestrator::billing::compute_fees(start, end, 20.0, &tariff, "UTC");

    // 30 min normal (09:30-10:00) -> 5 kWh @ 0.70 = 3.50
    // 90 min peak (10:00-11:30) -> 15 kWh @ 1.00 = 15.00
    assert!((fees.charging_fee.as_f64() - 18.50).abs() < 1e-6);
    assert!((fees.service_fee.as_f64() - 16.00).abs() < 1e-6);
    assert!((fees.total_fee.as_f64() - 34.50).abs() < 1e-6);
}

/// Scenario 6 — waiting-area full: admission is rejected once the
/// combined station-waiting lists reach capacity, and no durable session
/// is created for the rejected request.
#[tokio::test]
async fn waiting_area_full_rejects_without_creating_a_session() {
    let (_engine, orch, sessions) = harness(2);

    orch.submit("user-1", PileType::Fast, 5.0).await.unwrap();
    orch.submit("user-2", PileType::Fast, 5.0).await.unwrap();
    let err = orch.submit("user-3", PileType::Fast, 5.0).await.unwrap_err();

    assert_eq!(
        err.downcast::<charge_dispatch_core::error::OperationError>().unwrap(),
        charge_dispatch_core::error::OperationError::WaitingAreaFull
    );
    assert!(sessions.find_active_for_user("user-3").await.unwrap().is_none());
}
