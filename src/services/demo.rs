//! Synthetic controllers and a day of schedule entries for local runs.

use crate::db::models::{Controller, NewController, NewScheduleEntry};
use crate::dosing::ControllerId;
use crate::schema;
use crate::services::usage;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

// (name, flow rate in centiliters/min, daily cap in centiliters; 0 = unlimited)
const CONTROLLERS: [(&str, i64, i64); 4] = [
    ("Mother room drip", 150, 6_000),
    ("Veg room A", 225, 12_000),
    ("Flower room 1", 400, 0),
    ("Clone tray mister", 35, 500),
];
const WATERINGS_PER_DAY: u32 = 6;

pub fn run(conn: &mut PgConnection, now: DateTime<Utc>, utc_offset: FixedOffset) -> Result<(), String> {
    let mut rng = SmallRng::seed_from_u64(0x1EAF_0000_0000_C0DEu64);
    let day = now.with_timezone(&utc_offset).date_naive();
    let midnight = utc_offset
        .from_local_datetime(&day.and_time(NaiveTime::MIN))
        .single()
        .ok_or_else(|| format!("local midnight of {} is ambiguous", day))?
        .with_timezone(&Utc);

    let mut inserted = 0usize;
    for (name, flow_centi, cap_centi) in CONTROLLERS {
        let controller = ensure_controller(conn, name, Decimal::new(flow_centi, 2), Decimal::new(cap_centi, 2))?;
        let rows = plan_day(controller.controller_id(), midnight, &mut rng)?;

        use schema::schedule_entries::dsl as S;
        inserted += diesel::insert_into(S::schedule_entries)
            .values(&rows)
            .on_conflict((S::controller_id, S::scheduled_for))
            .do_nothing()
            .execute(conn)
            .map_err(|e| format!("insert demo schedule for '{}' failed: {}", name, e))?;

        let today = usage::usage_for(conn, controller.controller_id(), day)?;
        info!(
            "Demo: controller '{}' ({} l/min, cap {}) has {} l dispensed on {}",
            controller.name,
            controller.flow_rate,
            controller
                .max_volume_per_day
                .map(|c| format!("{} l", c))
                .unwrap_or_else(|| "unlimited".to_string()),
            today.dispensed_so_far,
            day
        );
    }

    info!("Demo: inserted {} schedule entr(ies) for {}", inserted, day);
    Ok(())
}

fn ensure_controller(conn: &mut PgConnection, name: &str, flow_rate: Decimal, cap: Decimal) -> Result<Controller, String> {
    use schema::controllers::dsl as C;

    let new_row = NewController::validated(name, flow_rate, Some(cap)).map_err(|e| format!("demo controller '{}': {}", name, e))?;
    diesel::insert_into(C::controllers)
        .values(&new_row)
        .on_conflict(C::name)
        .do_update()
        .set((
            C::flow_rate.eq(new_row.flow_rate),
            C::max_volume_per_day.eq(new_row.max_volume_per_day),
            C::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .map_err(|e| format!("upsert controller failed: {}", e))?;

    C::controllers
        .filter(C::name.eq(&new_row.name))
        .select(Controller::as_select())
        .first(conn)
        .map_err(|e| format!("fetch controller failed: {}", e))
}

/// Evenly spaced waterings from 06:00 local, every second one with an
/// explicit volume so both dosing paths get exercised.
fn plan_day(controller_id: ControllerId, midnight: DateTime<Utc>, rng: &mut impl Rng) -> Result<Vec<NewScheduleEntry>, String> {
    let mut rows = Vec::with_capacity(WATERINGS_PER_DAY as usize);
    for slot in 0..WATERINGS_PER_DAY {
        let at = midnight + Duration::hours(6) + Duration::minutes(i64::from(slot) * 150);
        let minutes = rng.random_range(2..=12u32);
        let volume = (slot % 2 == 1).then(|| Decimal::new(rng.random_range(50..=2_500i64), 2));
        let row = NewScheduleEntry::validated(controller_id, at, minutes, volume)
            .map_err(|e| format!("demo schedule entry: {}", e))?;
        rows.push(row);
    }
    Ok(rows)
}
