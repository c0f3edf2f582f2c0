//! Checks applied when controllers and schedule entries are entered.
//!
//! Values are rounded to storage precision here, once, before they are
//! persisted. A daily cap of `0` is accepted as the legacy spelling of
//! "unlimited" and stored as `NULL`.

use crate::dosing::{round_volume, ControllerProfile};
use core::fmt;
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Smallest flow rate, volume or cap that may be stored (0.01).
pub fn min_amount() -> Decimal {
    Decimal::new(1, 2)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    FlowRateTooSmall(Decimal),
    DailyCapTooSmall(Decimal),
    VolumeTooSmall(Decimal),
    ZeroDuration,
    EmptyName,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::FlowRateTooSmall(v) => {
                write!(f, "flow rate must be at least {} l/min, got {}", min_amount(), v)
            }
            ValidationError::DailyCapTooSmall(v) => write!(
                f,
                "max volume per day must be at least {} l (or 0/empty for unlimited), got {}",
                min_amount(),
                v
            ),
            ValidationError::VolumeTooSmall(v) => write!(f, "volume must be at least {} l, got {}", min_amount(), v),
            ValidationError::ZeroDuration => write!(f, "duration must be at least one minute"),
            ValidationError::EmptyName => write!(f, "controller name must not be empty"),
        }
    }
}

impl Error for ValidationError {}

/// Validated schedule input, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSchedule {
    pub duration_minutes: u32,
    pub volume: Option<Decimal>,
}

pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    Ok(trimmed.to_string())
}

pub fn validate_profile(
    flow_rate: Decimal,
    max_volume_per_day: Option<Decimal>,
) -> Result<ControllerProfile, ValidationError> {
    let flow_rate = round_volume(flow_rate);
    if flow_rate < min_amount() {
        return Err(ValidationError::FlowRateTooSmall(flow_rate));
    }

    // Only a literal zero means unlimited; anything else is checked after rounding.
    let max_volume_per_day = match max_volume_per_day {
        None => None,
        Some(cap) if cap.is_zero() => None,
        Some(cap) => {
            let cap = round_volume(cap);
            if cap < min_amount() {
                return Err(ValidationError::DailyCapTooSmall(cap));
            }
            Some(cap)
        }
    };

    Ok(ControllerProfile {
        flow_rate,
        max_volume_per_day,
    })
}

pub fn validate_schedule(duration_minutes: u32, volume: Option<Decimal>) -> Result<ValidatedSchedule, ValidationError> {
    if duration_minutes == 0 {
        return Err(ValidationError::ZeroDuration);
    }
    let volume = match volume.map(round_volume) {
        Some(v) if v < min_amount() => return Err(ValidationError::VolumeTooSmall(v)),
        other => other,
    };
    Ok(ValidatedSchedule {
        duration_minutes,
        volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let p = validate_profile(l("2.00"), Some(Decimal::ZERO)).unwrap();
        assert_eq!(p.max_volume_per_day, None);
        assert_eq!(p.daily_cap(), None);
    }

    #[test]
    fn rejects_negative_or_tiny_cap() {
        assert_eq!(
            validate_profile(l("2.00"), Some(l("-5"))),
            Err(ValidationError::DailyCapTooSmall(l("-5.00")))
        );
        assert_eq!(
            validate_profile(l("2.00"), Some(l("0.004"))),
            Err(ValidationError::DailyCapTooSmall(Decimal::ZERO))
        );
        assert!(matches!(
            validate_profile(l("2.00"), Some(l("-0.004"))),
            Err(ValidationError::DailyCapTooSmall(_))
        ));
        assert_eq!(
            validate_profile(l("2.00"), Some(l("0.00"))).unwrap().max_volume_per_day,
            None
        );
        assert_eq!(
            validate_profile(l("2.00"), Some(l("0.006"))).unwrap().max_volume_per_day,
            Some(l("0.01"))
        );
    }

    #[test]
    fn rejects_flow_rate_below_minimum() {
        assert!(matches!(
            validate_profile(l("0.004"), None),
            Err(ValidationError::FlowRateTooSmall(_))
        ));
        assert!(matches!(
            validate_profile(l("-1"), None),
            Err(ValidationError::FlowRateTooSmall(_))
        ));
        assert!(validate_profile(l("0.01"), None).is_ok());
    }

    #[test]
    fn rounds_to_storage_precision() {
        let p = validate_profile(l("1.235"), Some(l("49.995"))).unwrap();
        assert_eq!(p.flow_rate, l("1.24"));
        assert_eq!(p.max_volume_per_day, Some(l("50.00")));

        let s = validate_schedule(5, Some(l("2.345"))).unwrap();
        assert_eq!(s.volume, Some(l("2.35")));
    }

    #[test]
    fn schedule_requires_duration_and_positive_volume() {
        assert_eq!(validate_schedule(0, None), Err(ValidationError::ZeroDuration));
        assert!(matches!(
            validate_schedule(10, Some(Decimal::ZERO)),
            Err(ValidationError::VolumeTooSmall(_))
        ));
        assert_eq!(
            validate_schedule(10, None),
            Ok(ValidatedSchedule {
                duration_minutes: 10,
                volume: None
            })
        );
    }

    #[test]
    fn names_are_trimmed() {
        assert_eq!(validate_name("  Veg room A "), Ok("Veg room A".to_string()));
        assert_eq!(validate_name("   "), Err(ValidationError::EmptyName));
    }
}
