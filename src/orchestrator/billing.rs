//! C4 fee calculation: the segmented, boundary-proportional tariff
//! algorithm of SPEC_FULL.md §4.4. Pure functions — no I/O, no locks —
//! grounded on `examples/original_source/billing_service.py`'s
//! `calculate_charging_fee`, generalized from its single-bucket
//! approximation to the per-boundary segment split the spec calls for.

use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::TariffConfig;
use crate::domain::{Money, TariffBucket};

/// Local wall-clock hours at which the tariff can change (SPEC_FULL.md §4.4).
const BOUNDARY_HOURS: [u32; 7] = [0, 7, 10, 15, 18, 21, 23];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeBreakdown {
    pub charging_fee: Money,
    pub service_fee: Money,
    pub total_fee: Money,
    /// The tariff bucket the whole window billed at, when it never crossed a
    /// boundary. `None` once a charge spans more than one bucket.
    pub single_bucket: Option<TariffBucket>,
}

impl FeeBreakdown {
    fn zero() -> Self {
        Self {
            charging_fee: Money::zero(),
            service_fee: Money::zero(),
            total_fee: Money::zero(),
            single_bucket: None,
        }
    }
}

fn bucket_for_local_hour(hour: u32) -> TariffBucket {
    match hour {
        10..=14 | 18..=20 => TariffBucket::Peak,
        23 | 0..=6 => TariffBucket::Valley,
        _ => TariffBucket::Normal,
    }
}

fn rate(bucket: TariffBucket, tariff: &TariffConfig) -> f64 {
    match bucket {
        TariffBucket::Peak => tariff.peak_price,
        TariffBucket::Normal => tariff.normal_price,
        TariffBucket::Valley => tariff.valley_price,
    }
}

/// Boundary instants (as UTC) strictly between `start` and `end`, in the
/// given local timezone, sorted and deduplicated together with the two
/// endpoints.
fn segment_boundaries(start: DateTime<Utc>, end: DateTime<Utc>, tz: Tz) -> Vec<DateTime<Utc>> {
    let local_start = start.with_timezone(&tz);
    let local_end = end.with_timezone(&tz);

    let mut points = vec![start, end];
    let mut date = local_start.date_naive();
    let end_date = local_end.date_naive();
    loop {
        for hour in BOUNDARY_HOURS {
            if let Some(naive) = date.and_hms_opt(hour, 0, 0) {
                if let chrono::offset::LocalResult::Single(local_dt) = naive.and_local_timezone(tz) {
                    let utc_dt = local_dt.with_timezone(&Utc);
                    if utc_dt > start && utc_dt < end {
                        points.push(utc_dt);
                    }
                }
            }
        }
        if date >= end_date {
            break;
        }
        date = date.succ_opt().unwrap();
    }

    points.sort();
    points.dedup();
    points
}

/// The segmented, boundary-proportional algorithm of SPEC_FULL.md §4.4.
/// Returns all-zero fees when `actual_kwh <= 0` or `start >= end`.
pub fn compute_fees(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    actual_kwh: f64,
    tariff: &TariffConfig,
    timezone: &str,
) -> FeeBreakdown {
    if actual_kwh <= 0.0 || start >= end {
        return FeeBreakdown::zero();
    }

    let tz = Tz::from_str(timezone).unwrap_or(Tz::UTC);
    let total_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
    let boundaries = segment_boundaries(start, end, tz);

    let mut charging_total = 0.0;
    let mut single_bucket = None;
    for window in boundaries.windows(2) {
        let (s, e) = (window[0], window[1]);
        let seg_seconds = (e - s).num_milliseconds() as f64 / 1000.0;
        if seg_seconds <= 0.0 {
            continue;
        }
        let kwh_seg = actual_kwh * (seg_seconds / total_seconds);
        let local_hour = s.with_timezone(&tz).hour();
        let bucket = bucket_for_local_hour(local_hour);
        charging_total += kwh_seg * rate(bucket, tariff);
        single_bucket = Some(bucket);
    }
    // The window only ever billed at one rate if it has exactly two
    // boundary points (start, end) with nothing interior.
    if boundaries.len() != 2 {
        single_bucket = None;
    }

    let charging_fee = Money::new(charging_total);
    let service_fee = Money::new(actual_kwh * tariff.service_price);
    let total_fee = charging_fee + service_fee;

    FeeBreakdown {
        charging_fee,
        service_fee,
        total_fee,
        single_bucket,
    }
}
