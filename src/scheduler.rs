//! Calendar-mask scheduler: bitmask schedules to next-fire epochs, and
//! the run plan built from a task list (spec §4.1).

use chrono::{Datelike, Local, TimeZone, Timelike};

use crate::common::{PlanEntry, Schedule, Task};

const SECONDS_PER_MINUTE: i64 = 60;
const SEARCH_HORIZON_MINUTES: i64 = 366 * 24 * 60;

/// Returns the smallest epoch `t > from_epoch` with `t % 60 == 0` whose
/// local-time weekday/hour/minute all satisfy `schedule`, or `None` if
/// the schedule is disabled or no match exists within a one-year
/// horizon (spec §4.1 — this is a sentinel, not a fatal error).
pub fn next_occurrence(schedule: &Schedule, from_epoch: i64) -> Option<i64> {
    if !schedule.enabled {
        return None;
    }

    let from_epoch = from_epoch.max(0);
    let mut current = from_epoch - (from_epoch % SECONDS_PER_MINUTE) + SECONDS_PER_MINUTE;

    for _ in 0..SEARCH_HORIZON_MINUTES {
        let local = match Local.timestamp_opt(current, 0).single() {
            Some(dt) => dt,
            None => {
                current += SECONDS_PER_MINUTE;
                continue;
            }
        };

        let weekday = local.weekday().num_days_from_sunday();
        if schedule.weekday_allowed(weekday)
            && schedule.hour_allowed(local.hour())
            && schedule.minute_allowed(local.minute())
        {
            return Some(current);
        }

        current += SECONDS_PER_MINUTE;
    }

    None
}

/// Builds one plan entry per task, preserving the task list's order.
pub fn compute_plan(tasks: &[Task], reference_epoch: i64) -> Vec<PlanEntry> {
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| PlanEntry {
            task_id: task.task_id,
            task_index: index,
            next_epoch: next_occurrence(&task.schedule, reference_epoch),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn schedule(minutes: u64, hours: u32, weekdays: u8) -> Schedule {
        Schedule {
            minute_mask: minutes,
            hour_mask: hours,
            weekday_mask: weekdays,
            enabled: true,
        }
    }

    #[test]
    fn disabled_schedule_never_fires() {
        let mut s = schedule(u64::MAX, 0xFFFFFF, 0x7F);
        s.enabled = false;
        assert_eq!(next_occurrence(&s, 0), None);
    }

    #[test]
    fn empty_minute_mask_never_fires() {
        let s = schedule(0, 0xFFFFFF, 0x7F);
        assert_eq!(next_occurrence(&s, 0), None);
    }

    #[test]
    fn empty_hour_mask_never_fires() {
        let s = schedule(u64::MAX, 0, 0x7F);
        assert_eq!(next_occurrence(&s, 0), None);
    }

    #[test]
    fn strict_greater_than_from_epoch() {
        // Every minute of every hour, every day: the next occurrence
        // after exactly a matching minute is the following minute, not
        // the same one.
        let s = schedule(u64::MAX, 0xFFFFFF, 0x7F);
        let at_minute = Local.with_ymd_and_hms(2026, 1, 5, 10, 30, 0).unwrap().timestamp();
        let next = next_occurrence(&s, at_minute).unwrap();
        assert_eq!(next, at_minute + 60);
    }

    #[test]
    fn finds_first_matching_minute_of_matching_hour_and_weekday() {
        // Minute bit 4, hour bit 1, weekday bit 1 (Monday).
        let s = schedule(1 << 4, 1 << 1, 1 << 1);
        let sunday_midnight = Local
            .with_ymd_and_hms(2026, 8, 2, 0, 0, 0) // a Sunday
            .unwrap();
        assert_eq!(sunday_midnight.weekday().num_days_from_sunday(), 0);
        let next = next_occurrence(&s, sunday_midnight.timestamp()).unwrap();
        let got = Local.timestamp_opt(next, 0).single().unwrap();
        assert_eq!(got.weekday().num_days_from_sunday(), 1);
        assert_eq!(got.hour(), 1);
        assert_eq!(got.minute(), 4);
    }

    #[test]
    fn negative_from_epoch_is_clamped_to_zero() {
        let s = schedule(u64::MAX, 0xFFFFFF, 0x7F);
        let from_zero = next_occurrence(&s, 0);
        let from_negative = next_occurrence(&s, -1000);
        assert_eq!(from_zero, from_negative);
    }

    #[test]
    fn compute_plan_preserves_task_order_and_indices() {
        let mut abstract_task = Task {
            task_id: 9,
            kind: crate::common::TaskKind::Abstract,
            commands: vec![],
            schedule: Schedule::disabled(),
            last_run_epoch: -1,
        };
        let mut simple_task = abstract_task.clone();
        simple_task.task_id = 1;
        simple_task.kind = crate::common::TaskKind::Simple;
        simple_task.schedule = schedule(u64::MAX, 0xFFFFFF, 0x7F);
        abstract_task.task_id = 2;

        let plan = compute_plan(&[simple_task, abstract_task], 0);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].task_id, 1);
        assert_eq!(plan[0].task_index, 0);
        assert!(plan[0].next_epoch.is_some());
        assert_eq!(plan[1].task_id, 2);
        assert_eq!(plan[1].task_index, 1);
        assert_eq!(plan[1].next_epoch, None);
    }
}
