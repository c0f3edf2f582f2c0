use crate::db::models::{DailyUsageRow, NewDailyUsage};
use crate::dosing::{self, round_volume, ControllerId, ControllerProfile, DailyUsage, Decision};
use crate::schema;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::debug;
use rust_decimal::Decimal;

/// Where the executor books dispensed liters against the daily cap.
///
/// Implementations must run the check and the increment for one
/// `(controller_id, date)` as a single critical section.
pub trait UsageStore {
    fn authorize_and_record(
        &mut self,
        controller_id: ControllerId,
        date: NaiveDate,
        candidate: Decimal,
        profile: &ControllerProfile,
    ) -> Result<Decision, String>;
}

/// Decision for `candidate` against `usage`, plus the new total to store when
/// it is allowed. A rejected candidate leaves the total untouched.
pub fn settle(
    controller_id: ControllerId,
    date: NaiveDate,
    candidate: Decimal,
    profile: &ControllerProfile,
    usage: &DailyUsage,
) -> (Decision, Option<Decimal>) {
    let decision = dosing::authorize_dispense(controller_id, date, candidate, profile, usage);
    let total = decision
        .is_allowed()
        .then(|| round_volume(usage.dispensed_on(date) + candidate));
    (decision, total)
}

impl UsageStore for PgConnection {
    /// Check `candidate` against the controller's daily cap and, when allowed,
    /// add it to `daily_usage` in the same transaction.
    ///
    /// The `(controller_id, date)` row is created on demand and locked with
    /// `SELECT ... FOR UPDATE`, so concurrent executors serialise on it and can
    /// never both pass the check against a stale total.
    fn authorize_and_record(
        &mut self,
        controller_id: ControllerId,
        date: NaiveDate,
        candidate: Decimal,
        profile: &ControllerProfile,
    ) -> Result<Decision, String> {
        use schema::daily_usage::dsl as U;

        self.transaction::<Decision, diesel::result::Error, _>(|conn| {
            diesel::insert_into(U::daily_usage)
                .values(&NewDailyUsage::empty(controller_id, date))
                .on_conflict((U::controller_id, U::usage_date))
                .do_nothing()
                .execute(conn)?;

            let row: DailyUsageRow = U::daily_usage
                .filter(U::controller_id.eq(controller_id.0).and(U::usage_date.eq(date)))
                .select(DailyUsageRow::as_select())
                .for_update()
                .get_result(conn)?;

            let (decision, total) = settle(controller_id, date, candidate, profile, &row.usage());
            if let Some(total) = total {
                diesel::update(U::daily_usage.filter(U::controller_id.eq(controller_id.0).and(U::usage_date.eq(date))))
                    .set((U::dispensed_so_far.eq(total), U::updated_at.eq(Utc::now())))
                    .execute(conn)?;
                debug!(
                    "Usage: controller {} on {} now at {} l (+{} l)",
                    controller_id.0, date, total, candidate
                );
            }
            Ok(decision)
        })
        .map_err(|e| {
            format!(
                "daily usage transaction for controller {} on {} failed: {}",
                controller_id.0, date, e
            )
        })
    }
}

/// Current usage for a controller and day; an empty record when nothing was
/// dispensed yet.
pub fn usage_for(conn: &mut PgConnection, controller_id: ControllerId, date: NaiveDate) -> Result<DailyUsage, String> {
    use schema::daily_usage::dsl as U;

    U::daily_usage
        .filter(U::controller_id.eq(controller_id.0).and(U::usage_date.eq(date)))
        .select(DailyUsageRow::as_select())
        .first(conn)
        .optional()
        .map(|row| {
            row.map(|r| r.usage())
                .unwrap_or_else(|| DailyUsage::empty(controller_id, date))
        })
        .map_err(|e| format!("fetch daily usage failed: {}", e))
}
