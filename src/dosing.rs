//! Irrigation dosing calculator.
//!
//! Derives how many liters a schedule entry dispenses and decides whether a
//! controller's daily allowance still covers it. Both operations are pure;
//! persisting the accumulated usage is the job of [`crate::services::usage`],
//! which calls [`authorize_dispense`] while holding the `(controller, date)`
//! row lock.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use core::fmt;
use rust_decimal::{Decimal, RoundingStrategy};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Decimal places stored for every volume and flow column.
pub const VOLUME_SCALE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControllerId(pub i64);

/// Calibration of one physical irrigation controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerProfile {
    /// Liters per minute.
    pub flow_rate: Decimal,
    /// Liters per calendar day; `None` means unlimited.
    pub max_volume_per_day: Option<Decimal>,
}

impl ControllerProfile {
    /// The cap that actually applies. Values `<= 0` behave like an unset cap.
    pub fn daily_cap(&self) -> Option<Decimal> {
        self.max_volume_per_day.filter(|cap| *cap > Decimal::ZERO)
    }
}

/// A planned watering event.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub duration_minutes: Option<u32>,
    /// Explicit liters; takes precedence over `duration_minutes`.
    pub volume: Option<Decimal>,
    pub scheduled_for: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Calendar day this entry counts against, seen from `offset`.
    pub fn usage_date(&self, offset: FixedOffset) -> NaiveDate {
        self.scheduled_for.with_timezone(&offset).date_naive()
    }
}

/// Liters already dispensed by one controller on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyUsage {
    pub controller_id: ControllerId,
    pub date: NaiveDate,
    pub dispensed_so_far: Decimal,
}

impl DailyUsage {
    pub fn empty(controller_id: ControllerId, date: NaiveDate) -> Self {
        DailyUsage {
            controller_id,
            date,
            dispensed_so_far: Decimal::ZERO,
        }
    }

    /// Usage that counts against `date`. A record from another day carries
    /// nothing over.
    pub fn dispensed_on(&self, date: NaiveDate) -> Decimal {
        if self.date == date {
            self.dispensed_so_far
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DailyCapExceeded,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DailyCapExceeded => write!(f, "daily cap exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed,
    Rejected { reason: RejectReason, remaining: Decimal },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Errors raised while deriving a dispense volume.
#[derive(Debug, Clone, PartialEq)]
pub enum DosingError {
    /// The entry or its controller lacks the data needed to derive a volume.
    /// Fatal for the entry; must reach an operator.
    InvalidConfiguration(String),
}

impl Display for DosingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DosingError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl Error for DosingError {}

/// Round half-up to storage precision.
pub fn round_volume(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(VOLUME_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Liters the entry dispenses.
///
/// An explicit `volume` is returned unchanged. Otherwise the volume is
/// `flow_rate * duration_minutes`, rounded half-up to two decimals.
pub fn compute_volume(entry: &ScheduleEntry, profile: &ControllerProfile) -> Result<Decimal, DosingError> {
    if let Some(volume) = entry.volume {
        if volume <= Decimal::ZERO {
            return Err(DosingError::InvalidConfiguration(format!(
                "explicit volume must be positive, got {}",
                volume
            )));
        }
        return Ok(volume);
    }

    let minutes = entry.duration_minutes.filter(|m| *m > 0).ok_or_else(|| {
        DosingError::InvalidConfiguration("entry has neither a volume nor a positive duration".to_string())
    })?;
    if profile.flow_rate <= Decimal::ZERO {
        return Err(DosingError::InvalidConfiguration(format!(
            "controller flow rate must be positive, got {}",
            profile.flow_rate
        )));
    }

    let liters = profile
        .flow_rate
        .checked_mul(Decimal::from(minutes))
        .map(round_volume)
        .ok_or_else(|| {
            DosingError::InvalidConfiguration(format!(
                "volume overflow for {} l/min over {} min",
                profile.flow_rate, minutes
            ))
        })?;

    // Inputs below storage precision can round down to nothing.
    if liters <= Decimal::ZERO {
        return Err(DosingError::InvalidConfiguration(format!(
            "{} l/min over {} min rounds to {} l",
            profile.flow_rate, minutes, liters
        )));
    }
    Ok(liters)
}

/// Decide whether `candidate_liters` fits into the controller's allowance
/// for `date`. Never mutates `daily_usage`; on `Allowed` the caller adds
/// `candidate_liters` inside the same critical section.
pub fn authorize_dispense(
    controller_id: ControllerId,
    date: NaiveDate,
    candidate_liters: Decimal,
    profile: &ControllerProfile,
    daily_usage: &DailyUsage,
) -> Decision {
    debug_assert_eq!(
        daily_usage.controller_id, controller_id,
        "daily usage belongs to a different controller"
    );

    let Some(cap) = profile.daily_cap() else {
        return Decision::Allowed;
    };

    let used = daily_usage.dispensed_on(date);
    if used + candidate_liters <= cap {
        Decision::Allowed
    } else {
        Decision::Rejected {
            reason: RejectReason::DailyCapExceeded,
            remaining: (cap - used).max(Decimal::ZERO),
        }
    }
}
