#![cfg(feature = "db")]

//! Postgres-backed repository, grounded on the teacher's `repo/devices.rs`
//! `sqlx::query!`/`query_as!` CRUD style and `database/mod.rs`'s
//! retry-then-health-check pool construction. Enum/newtype columns are
//! stored as their plain scalar representation (`TEXT` for status, `FLOAT8`
//! for money/kWh) and mapped in Rust, since sqlx's compile-time macros need
//! a live database this crate cannot assume at build time here.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{info, warn};

use crate::domain::{ChargingRecord, Money, Pile, PileStatus, PileType, Session, SessionStatus, TariffBucket};

use super::{ExpectedStatus, PileRepository, SessionRepository};

pub struct PgRepo {
    pub pool: PgPool,
}

impl PgRepo {
    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        info!("connecting to durable session store");
        let pool = Self::connect_with_retry(url, max_connections, acquire_timeout, 5).await?;
        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database health check failed")?;
        info!("durable session store ready");
        Ok(Self { pool })
    }

    async fn connect_with_retry(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        max_attempts: usize,
    ) -> Result<PgPool> {
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);
        loop {
            attempt += 1;
            let attempted = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .connect(url)
                .await;
            match attempted {
                Ok(pool) => return Ok(pool),
                Err(e) if attempt >= max_attempts => {
                    return Err(e).context(format!("failed to connect after {} attempts", max_attempts));
                }
                Err(e) => {
                    warn!(attempt, %e, "database connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    pub fn sessions(&self) -> PgSessionRepository {
        PgSessionRepository { pool: self.pool.clone() }
    }

    pub fn piles(&self) -> PgPileRepository {
        PgPileRepository { pool: self.pool.clone() }
    }
}

fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::StationWaiting => "station_waiting",
        SessionStatus::EngineQueued => "engine_queued",
        SessionStatus::CancellingAfterDispatch => "cancelling_after_dispatch",
        SessionStatus::Charging => "charging",
        SessionStatus::Completing => "completing",
        SessionStatus::Completed => "completed",
        SessionStatus::Cancelled => "cancelled",
        SessionStatus::FaultCompleted => "fault_completed",
    }
}

fn parse_status(s: &str) -> SessionStatus {
    match s {
        "station_waiting" => SessionStatus::StationWaiting,
        "engine_queued" => SessionStatus::EngineQueued,
        "cancelling_after_dispatch" => SessionStatus::CancellingAfterDispatch,
        "charging" => SessionStatus::Charging,
        "completing" => SessionStatus::Completing,
        "completed" => SessionStatus::Completed,
        "cancelled" => SessionStatus::Cancelled,
        "fault_completed" => SessionStatus::FaultCompleted,
        other => unreachable!("unknown session status persisted: {other}"),
    }
}

fn bucket_str(b: TariffBucket) -> &'static str {
    match b {
        TariffBucket::Peak => "peak",
        TariffBucket::Normal => "normal",
        TariffBucket::Valley => "valley",
    }
}

fn parse_bucket(s: &str) -> TariffBucket {
    match s {
        "peak" => TariffBucket::Peak,
        "normal" => TariffBucket::Normal,
        "valley" => TariffBucket::Valley,
        other => unreachable!("unknown tariff bucket persisted: {other}"),
    }
}

fn mode_str(m: PileType) -> &'static str {
    match m {
        PileType::Fast => "fast",
        PileType::Trickle => "trickle",
    }
}

fn parse_mode(m: &str) -> PileType {
    PileType::from_str(m).unwrap_or_else(|_| panic!("unknown pile type persisted: {m}"))
}

impl FromStr for PileType {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fast" => Ok(PileType::Fast),
            "trickle" => Ok(PileType::Trickle),
            _ => Err(()),
        }
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Session {
    Session {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        pile_id: row.get("pile_id"),
        queue_number: row.get("queue_number"),
        mode: parse_mode(row.get::<String, _>("mode").as_str()),
        requested_kwh: row.get("requested_kwh"),
        actual_kwh: row.get("actual_kwh"),
        duration_hours: row.get("duration_hours"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        status: parse_status(row.get::<String, _>("status").as_str()),
        charging_fee: Money::new(row.get("charging_fee")),
        service_fee: Money::new(row.get("service_fee")),
        total_fee: Money::new(row.get("total_fee")),
        created_at: row.get("created_at"),
    }
}

pub struct PgSessionRepository {
    pool: PgPool,
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (session_id, user_id, pile_id, queue_number, mode, requested_kwh, actual_kwh,
                 duration_hours, start_time, end_time, status, charging_fee, service_fee, total_fee, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.pile_id)
        .bind(&session.queue_number)
        .bind(mode_str(session.mode))
        .bind(session.requested_kwh)
        .bind(session.actual_kwh)
        .bind(session.duration_hours)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(status_str(session.status))
        .bind(session.charging_fee.as_f64())
        .bind(session.service_fee.as_f64())
        .bind(session.total_fee.as_f64())
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .context("inserting session")?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading session")?;
        Ok(row.map(|r| row_to_session(&r)))
    }

    async fn update(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                pile_id = $2, queue_number = $3, mode = $4, requested_kwh = $5, actual_kwh = $6,
                duration_hours = $7, start_time = $8, end_time = $9, status = $10,
                charging_fee = $11, service_fee = $12, total_fee = $13
            WHERE session_id = $1
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.pile_id)
        .bind(&session.queue_number)
        .bind(mode_str(session.mode))
        .bind(session.requested_kwh)
        .bind(session.actual_kwh)
        .bind(session.duration_hours)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(status_str(session.status))
        .bind(session.charging_fee.as_f64())
        .bind(session.service_fee.as_f64())
        .bind(session.total_fee.as_f64())
        .execute(&self.pool)
        .await
        .context("updating session")?;
        Ok(())
    }

    async fn compare_and_update(&self, session: &Session, expected: ExpectedStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                pile_id = $2, queue_number = $3, actual_kwh = $4, duration_hours = $5,
                start_time = $6, end_time = $7, status = $8,
                charging_fee = $9, service_fee = $10, total_fee = $11
            WHERE session_id = $1 AND status = $12
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.pile_id)
        .bind(&session.queue_number)
        .bind(session.actual_kwh)
        .bind(session.duration_hours)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(status_str(session.status))
        .bind(session.charging_fee.as_f64())
        .bind(session.service_fee.as_f64())
        .bind(session.total_fee.as_f64())
        .bind(status_str(expected.0))
        .execute(&self.pool)
        .await
        .context("conditionally updating session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_active_for_user(&self, user_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"SELECT * FROM sessions WHERE user_id = $1
               AND status NOT IN ('completed','cancelled','fault_completed') LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding active session for user")?;
        Ok(row.map(|r| row_to_session(&r)))
    }

    async fn find_unique_by_pile_and_statuses(
        &self,
        pile_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Option<Session>> {
        let status_strs: Vec<&str> = statuses.iter().map(|s| status_str(*s)).collect();
        let row = sqlx::query("SELECT * FROM sessions WHERE pile_id = $1 AND status = ANY($2) LIMIT 1")
            .bind(pile_id)
            .bind(&status_strs[..])
            .fetch_optional(&self.pool)
            .await
            .context("finding session by pile and status")?;
        Ok(row.map(|r| row_to_session(&r)))
    }

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = $1")
            .bind(status_str(status))
            .fetch_all(&self.pool)
            .await
            .context("finding sessions by status")?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn find_timed_out_completing(&self, older_than_seconds: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'completing' AND start_time < NOW() - ($1 || ' seconds')::interval",
        )
        .bind(older_than_seconds.to_string())
        .fetch_all(&self.pool)
        .await
        .context("finding timed-out completing sessions")?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn insert_charging_record(&self, record: &ChargingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO charging_records
                (session_id, user_id, pile_id, start_time, end_time, energy_kwh,
                 charging_fee, service_fee, total_fee, single_bucket, status)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.pile_id)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.energy_kwh)
        .bind(record.charging_fee.as_f64())
        .bind(record.service_fee.as_f64())
        .bind(record.total_fee.as_f64())
        .bind(record.single_bucket.map(bucket_str))
        .bind(status_str(record.status))
        .execute(&self.pool)
        .await
        .context("inserting charging record")?;
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
        let offset = (page.saturating_sub(1) * per_page) as i64;
        let rows = sqlx::query(
            r#"
            SELECT * FROM charging_records
            WHERE user_id = $1 AND ($2::timestamptz IS NULL OR start_time >= $2)
              AND ($3::timestamptz IS NULL OR end_time <= $3)
            ORDER BY start_time DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("listing charging records")?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM charging_records WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("counting charging records")?;

        let records = rows
            .iter()
            .map(|r| ChargingRecord {
                session_id: r.get("session_id"),
                user_id: r.get("user_id"),
                pile_id: r.get("pile_id"),
                start_time: r.get("start_time"),
                end_time: r.get("end_time"),
                energy_kwh: r.get("energy_kwh"),
                charging_fee: Money::new(r.get("charging_fee")),
                service_fee: Money::new(r.get("service_fee")),
                total_fee: Money::new(r.get("total_fee")),
                single_bucket: r.get::<Option<String>, _>("single_bucket").as_deref().map(parse_bucket),
                status: parse_status(r.get::<String, _>("status").as_str()),
            })
            .collect();

        Ok((records, total as u64))
    }
}

pub struct PgPileRepository {
    pool: PgPool,
}

fn pile_status_str(s: PileStatus) -> &'static str {
    match s {
        PileStatus::Idle => "idle",
        PileStatus::Busy => "busy",
        PileStatus::Fault => "fault",
        PileStatus::Paused => "paused",
        PileStatus::Offline => "offline",
    }
}

fn parse_pile_status(s: &str) -> PileStatus {
    match s {
        "idle" => PileStatus::Idle,
        "busy" => PileStatus::Busy,
        "fault" => PileStatus::Fault,
        "paused" => PileStatus::Paused,
        "offline" => PileStatus::Offline,
        other => unreachable!("unknown pile status persisted: {other}"),
    }
}

#[async_trait]
impl PileRepository for PgPileRepository {
    async fn upsert(&self, pile: &Pile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO piles (pile_id, pile_type, max_kw, status, current_req_id, estimated_end,
                                lifetime_sessions, lifetime_energy_kwh, lifetime_revenue)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (pile_id) DO UPDATE SET
                status = EXCLUDED.status, current_req_id = EXCLUDED.current_req_id,
                estimated_end = EXCLUDED.estimated_end, lifetime_sessions = EXCLUDED.lifetime_sessions,
                lifetime_energy_kwh = EXCLUDED.lifetime_energy_kwh, lifetime_revenue = EXCLUDED.lifetime_revenue
            "#,
        )
        .bind(&pile.pile_id)
        .bind(mode_str(pile.pile_type))
        .bind(pile.max_kw)
        .bind(pile_status_str(pile.status))
        .bind(&pile.current_req_id)
        .bind(pile.estimated_end)
        .bind(pile.stats.lifetime_sessions as i64)
        .bind(pile.stats.lifetime_energy_kwh)
        .bind(pile.stats.lifetime_revenue)
        .execute(&self.pool)
        .await
        .context("upserting pile")?;
        Ok(())
    }

    async fn get(&self, pile_id: &str) -> Result<Option<Pile>> {
        let row = sqlx::query("SELECT * FROM piles WHERE pile_id = $1")
            .bind(pile_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading pile")?;
        Ok(row.map(|r| row_to_pile(&r)))
    }

    async fn list_all(&self) -> Result<Vec<Pile>> {
        let rows = sqlx::query("SELECT * FROM piles")
            .fetch_all(&self.pool)
            .await
            .context("listing piles")?;
        Ok(rows.iter().map(row_to_pile).collect())
    }
}

fn row_to_pile(row: &sqlx::postgres::PgRow) -> Pile {
    use crate::domain::PileStats;
    Pile {
        pile_id: row.get("pile_id"),
        pile_type: parse_mode(row.get::<String, _>("pile_type").as_str()),
        max_kw: row.get("max_kw"),
        status: parse_pile_status(row.get::<String, _>("status").as_str()),
        current_req_id: row.get("current_req_id"),
        estimated_end: row.get("estimated_end"),
        stats: PileStats {
            lifetime_sessions: row.get::<i64, _>("lifetime_sessions") as u64,
            lifetime_energy_kwh: row.get("lifetime_energy_kwh"),
            lifetime_revenue: row.get("lifetime_revenue"),
        },
    }
}
