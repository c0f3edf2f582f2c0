use crate::bridge::{DispenseCommand, ValveActuator};
use crate::db::models::{entry_status, Controller, NewDispenseEvent, ScheduleEntryRow};
use crate::dosing::{self, ControllerProfile, Decision, DosingError, ScheduleEntry};
use crate::schema;
use crate::services::usage::UsageStore;
use chrono::{DateTime, FixedOffset, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, error, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    /// Maximum due entries handled per tick.
    pub batch_size: i64,
    /// Offset that defines the calendar day for daily caps.
    pub utc_offset: FixedOffset,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub dispensed: usize,
    pub skipped_cap: usize,
    pub invalid_config: usize,
    pub bridge_failed: usize,
    /// Entries another executor claimed first.
    pub lost_claim: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Dispensed { .. } => self.dispensed += 1,
            EntryOutcome::SkippedCap { .. } => self.skipped_cap += 1,
            EntryOutcome::InvalidConfig(_) => self.invalid_config += 1,
            EntryOutcome::BridgeFailed { .. } => self.bridge_failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EntryOutcome {
    Dispensed { liters: Decimal, job_id: Option<String> },
    SkippedCap { liters: Decimal, remaining: Decimal },
    InvalidConfig(DosingError),
    BridgeFailed { liters: Decimal, error: String },
}

impl EntryOutcome {
    fn status(&self) -> &'static str {
        match self {
            EntryOutcome::Dispensed { .. } => entry_status::DISPENSED,
            EntryOutcome::SkippedCap { .. } => entry_status::SKIPPED_CAP,
            EntryOutcome::InvalidConfig(_) => entry_status::INVALID_CONFIG,
            EntryOutcome::BridgeFailed { .. } => entry_status::BRIDGE_FAILED,
        }
    }

    fn into_event(self, time: DateTime<Utc>, controller_id: i64, schedule_entry_id: i64) -> NewDispenseEvent {
        let mut event = NewDispenseEvent::new(time, controller_id, schedule_entry_id, self.status());
        match self {
            EntryOutcome::Dispensed { liters, job_id } => {
                event.liters = Some(liters);
                event.message = job_id.map(|j| format!("bridge job {}", j));
            }
            EntryOutcome::SkippedCap { liters, remaining } => {
                event.liters = Some(liters);
                event.remaining = Some(remaining);
                event.message = Some(format!("daily cap exceeded, {} l remaining", remaining));
            }
            EntryOutcome::InvalidConfig(e) => event.message = Some(e.to_string()),
            EntryOutcome::BridgeFailed { liters, error } => {
                event.liters = Some(liters);
                event.message = Some(error);
            }
        }
        event
    }
}

pub fn run_loop(
    conn: &mut PgConnection,
    actuator: &dyn ValveActuator,
    settings: &ExecutorSettings,
) -> Result<(), String> {
    loop {
        let tick_start = Instant::now();

        let summary = run_tick(conn, actuator, settings, Utc::now())?;
        if summary.due > 0 {
            info!(
                "Executor: tick handled {} due entr(ies): dispensed={}, skipped_cap={}, invalid_config={}, bridge_failed={}, lost_claim={}",
                summary.due,
                summary.dispensed,
                summary.skipped_cap,
                summary.invalid_config,
                summary.bridge_failed,
                summary.lost_claim
            );
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < settings.poll_interval {
            thread::sleep(settings.poll_interval - elapsed);
        }
    }
}

/// Execute every entry due at `now`, oldest first.
pub fn run_tick(
    conn: &mut PgConnection,
    actuator: &dyn ValveActuator,
    settings: &ExecutorSettings,
    now: DateTime<Utc>,
) -> Result<TickSummary, String> {
    let due = load_due(conn, now, settings.batch_size)?;
    let mut summary = TickSummary {
        due: due.len(),
        ..TickSummary::default()
    };

    for (row, controller) in &due {
        if !claim(conn, row.id)? {
            debug!("Executor: entry {} already claimed elsewhere", row.id);
            summary.lost_claim += 1;
            continue;
        }

        let outcome = match execute_entry(conn, actuator, controller, row, settings.utc_offset) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Leave the entry for the next tick; nothing was dispensed.
                release(conn, row.id)?;
                return Err(e);
            }
        };
        summary.record(&outcome);
        let event = outcome.into_event(Utc::now(), controller.id, row.id);
        if let Err(e) = finish(conn, row.id, &event) {
            error!("{}", unrecorded_outcome_message(row.id, &event, &e));
            return Err(e);
        }
    }

    Ok(summary)
}

fn execute_entry<S: UsageStore + ?Sized>(
    store: &mut S,
    actuator: &dyn ValveActuator,
    controller: &Controller,
    row: &ScheduleEntryRow,
    utc_offset: FixedOffset,
) -> Result<EntryOutcome, String> {
    let entry = row.entry();
    let profile = controller.profile();

    let liters = match dosing::compute_volume(&entry, &profile) {
        Ok(liters) => liters,
        Err(e) => {
            error!(
                "Executor: entry {} for controller '{}' cannot be dispensed, operator action required: {}",
                row.id, controller.name, e
            );
            return Ok(EntryOutcome::InvalidConfig(e));
        }
    };

    let date = entry.usage_date(utc_offset);
    match store.authorize_and_record(controller.controller_id(), date, liters, &profile)? {
        Decision::Allowed => {}
        Decision::Rejected { reason, remaining } => {
            warn!(
                "Executor: skipping entry {} for controller '{}' on {}: {} ({} l requested, {} l remaining)",
                row.id, controller.name, date, reason, liters, remaining
            );
            return Ok(EntryOutcome::SkippedCap { liters, remaining });
        }
    }

    let cmd = DispenseCommand {
        controller_id: controller.controller_id(),
        schedule_entry_id: row.id,
        liters,
        duration_seconds: valve_open_seconds(&entry, &profile, liters),
    };
    match actuator.dispense(&cmd) {
        Ok(receipt) => {
            info!(
                "Executor: controller '{}' dispensing {} l over {} s for entry {} via {}",
                controller.name,
                liters,
                cmd.duration_seconds,
                row.id,
                actuator.name()
            );
            Ok(EntryOutcome::Dispensed {
                liters,
                job_id: receipt.job_id,
            })
        }
        Err(e) => {
            // Usage stays booked: the valve may have opened before the failure.
            error!(
                "Executor: bridge {} failed to dispense entry {} for controller '{}': {}",
                actuator.name(),
                row.id,
                controller.name,
                e
            );
            Ok(EntryOutcome::BridgeFailed {
                liters,
                error: e.to_string(),
            })
        }
    }
}

/// The entry stays `claimed` when its outcome cannot be written; the valve
/// may already have run, so it must not be retried automatically.
fn unrecorded_outcome_message(entry_id: i64, event: &NewDispenseEvent, err: &str) -> String {
    format!(
        "Executor: entry {} left claimed, outcome '{}' ({} l) was not recorded, operator action required: {}",
        entry_id,
        event.outcome,
        event.liters.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        err
    )
}

/// How long the valve stays open. Computed volumes reuse the planned
/// duration; explicit volumes derive it from the flow rate, rounded up.
fn valve_open_seconds(entry: &ScheduleEntry, profile: &ControllerProfile, liters: Decimal) -> u32 {
    let planned = entry.duration_minutes.map(|m| m.saturating_mul(60));
    if entry.volume.is_none()
        && let Some(secs) = planned
    {
        return secs;
    }

    (liters * Decimal::from(60))
        .checked_div(profile.flow_rate)
        .filter(|_| profile.flow_rate > Decimal::ZERO)
        .and_then(|secs| secs.ceil().to_u32())
        .or(planned)
        .unwrap_or(0)
}

fn load_due(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<Vec<(ScheduleEntryRow, Controller)>, String> {
    use schema::controllers::dsl as C;
    use schema::schedule_entries::dsl as S;

    S::schedule_entries
        .inner_join(C::controllers)
        .filter(S::status.eq(entry_status::PENDING))
        .filter(S::scheduled_for.le(now))
        .filter(C::active.eq(true))
        .order(S::scheduled_for.asc())
        .limit(batch_size)
        .select((ScheduleEntryRow::as_select(), Controller::as_select()))
        .load(conn)
        .map_err(|e| format!("load due schedule entries failed: {}", e))
}

fn claim(conn: &mut PgConnection, entry_id: i64) -> Result<bool, String> {
    use schema::schedule_entries::dsl as S;

    diesel::update(S::schedule_entries.filter(S::id.eq(entry_id).and(S::status.eq(entry_status::PENDING))))
        .set(S::status.eq(entry_status::CLAIMED))
        .execute(conn)
        .map(|count| count == 1)
        .map_err(|e| format!("claim schedule entry {} failed: {}", entry_id, e))
}

fn release(conn: &mut PgConnection, entry_id: i64) -> Result<(), String> {
    use schema::schedule_entries::dsl as S;

    diesel::update(S::schedule_entries.filter(S::id.eq(entry_id).and(S::status.eq(entry_status::CLAIMED))))
        .set(S::status.eq(entry_status::PENDING))
        .execute(conn)
        .map(|_| ())
        .map_err(|e| format!("release schedule entry {} failed: {}", entry_id, e))
}

fn finish(conn: &mut PgConnection, entry_id: i64, event: &NewDispenseEvent) -> Result<(), String> {
    use schema::dispense_events::dsl as E;
    use schema::schedule_entries::dsl as S;

    let dispensed_volume = if event.outcome == entry_status::DISPENSED {
        event.liters
    } else {
        None
    };

    conn.transaction::<(), diesel::result::Error, _>(|conn| {
        diesel::update(S::schedule_entries.find(entry_id))
            .set((
                S::status.eq(&event.outcome),
                S::dispensed_volume.eq(dispensed_volume),
                S::executed_at.eq(Some(event.time)),
            ))
            .execute(conn)?;
        diesel::insert_into(E::dispense_events).values(event).execute(conn)?;
        Ok(())
    })
    .map_err(|e| format!("record outcome of schedule entry {} failed: {}", entry_id, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, DispenseReceipt};
    use crate::dosing::{ControllerId, DailyUsage};
    use crate::services::usage;
    use chrono::{NaiveDate, TimeZone};
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn l(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    fn entry(minutes: Option<u32>, volume: Option<&str>) -> ScheduleEntry {
        ScheduleEntry {
            duration_minutes: minutes,
            volume: volume.map(l),
            scheduled_for: Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap(),
        }
    }

    fn profile(flow: &str) -> ControllerProfile {
        ControllerProfile {
            flow_rate: l(flow),
            max_volume_per_day: None,
        }
    }

    #[test]
    fn computed_volume_keeps_planned_duration() {
        assert_eq!(valve_open_seconds(&entry(Some(10), None), &profile("2.00"), l("20.00")), 600);
    }

    #[test]
    fn explicit_volume_derives_duration_from_flow() {
        // 5 l at 2 l/min = 150 s
        assert_eq!(valve_open_seconds(&entry(Some(10), Some("5.00")), &profile("2.00"), l("5.00")), 150);
        // 1 l at 3 l/min = 20 s
        assert_eq!(valve_open_seconds(&entry(None, Some("1.00")), &profile("3.00"), l("1.00")), 20);
        // 1 l at 7 l/min = 8.57.. s, rounded up
        assert_eq!(valve_open_seconds(&entry(None, Some("1.00")), &profile("7.00"), l("1.00")), 9);
    }

    #[test]
    fn zero_flow_falls_back_to_planned_duration() {
        assert_eq!(valve_open_seconds(&entry(Some(4), Some("5.00")), &profile("0"), l("5.00")), 240);
        assert_eq!(valve_open_seconds(&entry(None, Some("5.00")), &profile("0"), l("5.00")), 0);
    }

    #[test]
    fn skipped_outcome_event_reports_remaining() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 5).unwrap();
        let event = EntryOutcome::SkippedCap {
            liters: l("10.00"),
            remaining: l("5.00"),
        }
        .into_event(ts, 3, 11);
        assert_eq!(event.outcome, entry_status::SKIPPED_CAP);
        assert_eq!(event.liters, Some(l("10.00")));
        assert_eq!(event.remaining, Some(l("5.00")));
        assert_eq!(event.controller_id, 3);
        assert_eq!(event.schedule_entry_id, 11);
        assert!(event.message.unwrap().contains("5.00 l remaining"));
    }

    #[test]
    fn invalid_config_event_carries_error() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 5).unwrap();
        let err = DosingError::InvalidConfiguration("entry has neither a volume nor a positive duration".into());
        let event = EntryOutcome::InvalidConfig(err).into_event(ts, 3, 12);
        assert_eq!(event.outcome, entry_status::INVALID_CONFIG);
        assert_eq!(event.liters, None);
        assert_eq!(
            event.message.as_deref(),
            Some("invalid configuration: entry has neither a volume nor a positive duration")
        );
    }

    #[test]
    fn summary_counts_by_outcome() {
        let mut summary = TickSummary::default();
        summary.record(&EntryOutcome::Dispensed {
            liters: l("1.00"),
            job_id: None,
        });
        summary.record(&EntryOutcome::BridgeFailed {
            liters: l("1.00"),
            error: "http 503".into(),
        });
        summary.record(&EntryOutcome::Dispensed {
            liters: l("2.00"),
            job_id: Some("j".into()),
        });
        assert_eq!(summary.dispensed, 2);
        assert_eq!(summary.bridge_failed, 1);
        assert_eq!(summary.skipped_cap, 0);
    }

    /// Books usage in memory with the same decision rule as the database store.
    #[derive(Default)]
    struct MemoryStore {
        totals: HashMap<(ControllerId, NaiveDate), Decimal>,
    }

    impl MemoryStore {
        fn total(&self, controller_id: ControllerId, date: NaiveDate) -> Decimal {
            self.totals.get(&(controller_id, date)).copied().unwrap_or(Decimal::ZERO)
        }
    }

    impl UsageStore for MemoryStore {
        fn authorize_and_record(
            &mut self,
            controller_id: ControllerId,
            date: NaiveDate,
            candidate: Decimal,
            profile: &ControllerProfile,
        ) -> Result<Decision, String> {
            let current = DailyUsage {
                controller_id,
                date,
                dispensed_so_far: self.total(controller_id, date),
            };
            let (decision, total) = usage::settle(controller_id, date, candidate, profile, &current);
            if let Some(total) = total {
                self.totals.insert((controller_id, date), total);
            }
            Ok(decision)
        }
    }

    #[derive(Default)]
    struct RecordingActuator {
        calls: RefCell<Vec<DispenseCommand>>,
        fail: bool,
    }

    impl ValveActuator for RecordingActuator {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn dispense(&self, cmd: &DispenseCommand) -> Result<DispenseReceipt, BridgeError> {
            self.calls.borrow_mut().push(cmd.clone());
            if self.fail {
                return Err(BridgeError::Http {
                    status: 503,
                    message: "gateway busy".into(),
                });
            }
            Ok(DispenseReceipt {
                job_id: Some(format!("job-{}", cmd.schedule_entry_id)),
                accepted: true,
                message: None,
            })
        }
    }

    fn controller(flow: &str, cap: Option<&str>) -> Controller {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        Controller {
            id: 7,
            name: "Veg room A".into(),
            flow_rate: l(flow),
            max_volume_per_day: cap.map(l),
            active: true,
            created_at: ts,
            updated_at: ts,
        }
    }

    fn row(id: i64, hour: u32, minutes: i32, volume: Option<&str>) -> ScheduleEntryRow {
        ScheduleEntryRow {
            id,
            controller_id: 7,
            scheduled_for: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            duration_minutes: minutes,
            volume: volume.map(l),
            status: entry_status::CLAIMED.into(),
            dispensed_volume: None,
            executed_at: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn entries_fill_the_cap_exactly_then_skip() {
        let c = controller("2.00", Some("50.00"));
        let mut store = MemoryStore::default();
        let actuator = RecordingActuator::default();
        let utc = FixedOffset::east_opt(0).unwrap();

        // 15 min at 2 l/min, then an explicit 20 l: exactly 50 l.
        let first = execute_entry(&mut store, &actuator, &c, &row(1, 6, 15, None), utc).unwrap();
        let second = execute_entry(&mut store, &actuator, &c, &row(2, 9, 10, Some("20.00")), utc).unwrap();
        assert_eq!(
            first,
            EntryOutcome::Dispensed {
                liters: l("30.00"),
                job_id: Some("job-1".into())
            }
        );
        assert!(matches!(second, EntryOutcome::Dispensed { liters, .. } if liters == l("20.00")));
        assert_eq!(store.total(c.controller_id(), day()), l("50.00"));

        let third = execute_entry(&mut store, &actuator, &c, &row(3, 12, 1, None), utc).unwrap();
        assert_eq!(
            third,
            EntryOutcome::SkippedCap {
                liters: l("2.00"),
                remaining: Decimal::ZERO
            }
        );
        assert_eq!(store.total(c.controller_id(), day()), l("50.00"));

        let calls = actuator.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].duration_seconds, 900);
        assert_eq!(calls[1].duration_seconds, 600);
    }

    #[test]
    fn invalid_config_never_reaches_actuator() {
        let c = controller("2.00", Some("50.00"));
        let mut store = MemoryStore::default();
        let actuator = RecordingActuator::default();

        let outcome = execute_entry(&mut store, &actuator, &c, &row(4, 6, 0, None), FixedOffset::east_opt(0).unwrap())
            .unwrap();
        assert!(matches!(outcome, EntryOutcome::InvalidConfig(DosingError::InvalidConfiguration(_))));
        assert!(actuator.calls.borrow().is_empty());
        assert!(store.totals.is_empty());
    }

    #[test]
    fn bridge_failure_keeps_usage_booked() {
        let c = controller("2.00", Some("50.00"));
        let mut store = MemoryStore::default();
        let actuator = RecordingActuator {
            fail: true,
            ..RecordingActuator::default()
        };

        let outcome = execute_entry(&mut store, &actuator, &c, &row(5, 6, 10, None), FixedOffset::east_opt(0).unwrap())
            .unwrap();
        assert!(matches!(outcome, EntryOutcome::BridgeFailed { liters, .. } if liters == l("20.00")));
        assert_eq!(actuator.calls.borrow().len(), 1);
        assert_eq!(store.total(c.controller_id(), day()), l("20.00"));
    }

    #[test]
    fn usage_day_follows_configured_offset() {
        let c = controller("1.00", Some("10.00"));
        let mut store = MemoryStore::default();
        let actuator = RecordingActuator::default();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();

        // 23:00 UTC on 1 June is already 2 June at +02:00.
        execute_entry(&mut store, &actuator, &c, &row(6, 23, 5, None), plus_two).unwrap();
        assert_eq!(store.total(c.controller_id(), day()), Decimal::ZERO);
        assert_eq!(store.total(c.controller_id(), day().succ_opt().unwrap()), l("5.00"));
    }

    #[test]
    fn unrecorded_outcome_names_the_entry() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 5).unwrap();
        let event = EntryOutcome::Dispensed {
            liters: l("20.00"),
            job_id: None,
        }
        .into_event(ts, 7, 42);
        let msg = unrecorded_outcome_message(42, &event, "connection reset");
        assert!(msg.contains("entry 42 left claimed"));
        assert!(msg.contains("'dispensed' (20.00 l)"));
        assert!(msg.ends_with("connection reset"));
    }
}
