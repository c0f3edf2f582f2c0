//! Diesel model structs for controllers, their schedule and dispense history.
//!
//! Rows convert into the plain types of [`crate::dosing`] so the calculator
//! never sees Diesel.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::dosing::{ControllerId, ControllerProfile, DailyUsage, ScheduleEntry};
use crate::schema;
use crate::validation::{self, ValidationError};

// Values of `schedule_entries.status`; terminal ones double as `dispense_events.outcome`.
pub mod entry_status {
    pub const PENDING: &str = "pending";
    /// Picked up by an executor, dispense in progress.
    pub const CLAIMED: &str = "claimed";

    pub const DISPENSED: &str = "dispensed";
    pub const SKIPPED_CAP: &str = "skipped_cap";
    pub const INVALID_CONFIG: &str = "invalid_config";
    pub const BRIDGE_FAILED: &str = "bridge_failed";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::controllers)]
pub struct Controller {
    pub id: i64,
    pub name: String,
    pub flow_rate: Decimal,
    pub max_volume_per_day: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Controller {
    pub fn controller_id(&self) -> ControllerId {
        ControllerId(self.id)
    }

    pub fn profile(&self) -> ControllerProfile {
        ControllerProfile {
            flow_rate: self.flow_rate,
            max_volume_per_day: self.max_volume_per_day,
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::controllers)]
pub struct NewController {
    pub name: String,
    pub flow_rate: Decimal,
    pub max_volume_per_day: Option<Decimal>,
    pub active: bool,
}

impl NewController {
    pub fn validated(
        name: &str,
        flow_rate: Decimal,
        max_volume_per_day: Option<Decimal>,
    ) -> Result<Self, ValidationError> {
        let name = validation::validate_name(name)?;
        let profile = validation::validate_profile(flow_rate, max_volume_per_day)?;
        Ok(NewController {
            name,
            flow_rate: profile.flow_rate,
            max_volume_per_day: profile.max_volume_per_day,
            active: true,
        })
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::schedule_entries)]
#[diesel(belongs_to(Controller))]
pub struct ScheduleEntryRow {
    pub id: i64,
    pub controller_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub duration_minutes: i32,
    pub volume: Option<Decimal>,
    pub status: String,
    pub dispensed_volume: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntryRow {
    pub fn entry(&self) -> ScheduleEntry {
        ScheduleEntry {
            duration_minutes: u32::try_from(self.duration_minutes).ok().filter(|m| *m > 0),
            volume: self.volume,
            scheduled_for: self.scheduled_for,
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::schedule_entries)]
pub struct NewScheduleEntry {
    pub controller_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub duration_minutes: i32,
    pub volume: Option<Decimal>,
    pub status: String,
}

impl NewScheduleEntry {
    pub fn validated(
        controller_id: ControllerId,
        scheduled_for: DateTime<Utc>,
        duration_minutes: u32,
        volume: Option<Decimal>,
    ) -> Result<Self, ValidationError> {
        let checked = validation::validate_schedule(duration_minutes, volume)?;
        Ok(NewScheduleEntry {
            controller_id: controller_id.0,
            scheduled_for,
            duration_minutes: i32::try_from(checked.duration_minutes).unwrap_or(i32::MAX),
            volume: checked.volume,
            status: entry_status::PENDING.to_string(),
        })
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::daily_usage)]
#[diesel(primary_key(controller_id, usage_date))]
#[diesel(belongs_to(Controller))]
pub struct DailyUsageRow {
    pub controller_id: i64,
    pub usage_date: NaiveDate,
    pub dispensed_so_far: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl DailyUsageRow {
    pub fn usage(&self) -> DailyUsage {
        DailyUsage {
            controller_id: ControllerId(self.controller_id),
            date: self.usage_date,
            dispensed_so_far: self.dispensed_so_far,
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::daily_usage)]
pub struct NewDailyUsage {
    pub controller_id: i64,
    pub usage_date: NaiveDate,
    pub dispensed_so_far: Decimal,
}

impl NewDailyUsage {
    pub fn empty(controller_id: ControllerId, usage_date: NaiveDate) -> Self {
        NewDailyUsage {
            controller_id: controller_id.0,
            usage_date,
            dispensed_so_far: Decimal::ZERO,
        }
    }
}

// Audit trail: one row per execution attempt of a schedule entry.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::dispense_events)]
pub struct NewDispenseEvent {
    pub time: DateTime<Utc>,
    pub controller_id: i64,
    pub schedule_entry_id: i64,
    pub outcome: String,
    pub liters: Option<Decimal>,
    pub remaining: Option<Decimal>,
    pub message: Option<String>,
}

impl NewDispenseEvent {
    pub fn new(time: DateTime<Utc>, controller_id: i64, schedule_entry_id: i64, outcome: &str) -> Self {
        NewDispenseEvent {
            time,
            controller_id,
            schedule_entry_id,
            outcome: outcome.to_string(),
            liters: None,
            remaining: None,
            message: None,
        }
    }
}
