use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;

/// Charging mode a pile serves and a request asks for.
///
/// `Fast` piles are direct-current, high power; `Trickle` piles are
/// alternating-current, low power. The single-letter `type_letter` feeds the
/// queue-number format (`<L><YYYYMMDD><NNNNNN>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay)]
pub enum PileType {
    Fast,
    Trickle,
}

impl PileType {
    pub fn type_letter(self) -> char {
        match self {
            PileType::Fast => 'F',
            PileType::Trickle => 'T',
        }
    }

    pub fn all() -> [PileType; 2] {
        [PileType::Fast, PileType::Trickle]
    }
}

/// Operational status of a pile. `Offline` is administrative: the pile is
/// excluded from assignment but is not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
pub enum PileStatus {
    Idle,
    Busy,
    Fault,
    Paused,
    Offline,
}

/// Session lifecycle state. See SPEC_FULL.md §3 for the full transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
pub enum SessionStatus {
    StationWaiting,
    EngineQueued,
    CancellingAfterDispatch,
    Charging,
    Completing,
    Completed,
    Cancelled,
    FaultCompleted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::FaultCompleted
        )
    }
}

/// Tariff bucket a fee segment falls into, determined by wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
pub enum TariffBucket {
    Peak,
    Normal,
    Valley,
}

/// A currency amount, rounded to 2 decimal places at construction and on
/// every arithmetic result so running totals never accumulate float noise
/// beyond a cent. Wraps a plain `f64` rather than a fixed-point decimal type,
/// following the newtype-over-primitive style used throughout this module.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
pub struct Money(pub f64);

impl Money {
    pub fn new(amount: f64) -> Self {
        Self(round_to(amount, 100.0))
    }

    pub fn zero() -> Self {
        Self(0.0)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Energy amount in kWh, rounded to 4 decimal places per the persisted
/// precision in SPEC_FULL.md §6 ("energy with 4 decimals").
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
pub struct Kwh(pub f64);

impl Kwh {
    pub fn new(v: f64) -> Self {
        Self(round_to(v, 10_000.0))
    }

    pub fn zero() -> Self {
        Self(0.0)
    }
}

impl fmt::Display for Kwh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

fn round_to(v: f64, scale: f64) -> f64 {
    (v * scale).round() / scale
}
