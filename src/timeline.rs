use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::clock::Clock;
use crate::db::{Database, TimeLogFilter};
use crate::error::TimerError;
use crate::models::{
    ActivityItem, ActivityType, DayTotal, LogSource, LogStatus, TaskTimeReport, TimeLogEntry,
    TimeLogView, TimelinePage, TimesheetSummary, minutes_to_hours,
};

// Rows predating the source column: a session terminated this close to its
// creation was almost certainly typed in by hand.
const LEGACY_MANUAL_WINDOW_SECS: i64 = 300;

/// Activity classification for feed rendering.
pub fn classify(entry: &TimeLogEntry) -> ActivityType {
    match entry.source {
        Some(LogSource::Manual) => ActivityType::ManualEntry,
        Some(LogSource::Timer) => running_or_stopped(entry),
        None => {
            if let Some(end) = entry.end_time {
                if (end - entry.created_at).num_seconds().abs() < LEGACY_MANUAL_WINDOW_SECS {
                    return ActivityType::ManualEntry;
                }
            }
            running_or_stopped(entry)
        }
    }
}

fn running_or_stopped(entry: &TimeLogEntry) -> ActivityType {
    if entry.is_running() {
        if entry.is_paused() {
            ActivityType::TimerPaused
        } else {
            ActivityType::TimerStarted
        }
    } else {
        ActivityType::TimerStopped
    }
}

/// Read-only duration projection. Terminated entries report their stored
/// (already net) duration; running entries get the stop formula applied at
/// `paused_at` when paused, else at `now`. Nothing is persisted.
pub fn current_duration_minutes(entry: &TimeLogEntry, now: DateTime<Utc>) -> i64 {
    if entry.end_time.is_some() {
        return entry.duration_minutes.max(0);
    }

    let cutoff = entry.paused_at.unwrap_or(now);
    let total_seconds = (cutoff - entry.start_time).num_seconds().max(0);
    let paused_seconds = entry.paused_duration_minutes * 60;
    let net_seconds = (total_seconds - paused_seconds).max(0);
    (net_seconds + 59) / 60
}

/// Paginated, reverse-chronological activity feed. An empty first page
/// falls back to recently-created tasks as placeholder items so the feed
/// is never blank for a fresh account.
pub fn timeline(
    db: &Database,
    clock: &dyn Clock,
    filter: &TimeLogFilter,
    page: i64,
    per_page: i64,
) -> Result<TimelinePage, TimerError> {
    let page = page.max(1);
    let per_page = per_page.max(1);

    let total = db.count_entries(filter)?;
    let offset = (page - 1) * per_page;
    let entries = db.list_entries_page(filter, per_page, offset)?;
    let now = clock.now();

    let mut activities = Vec::with_capacity(entries.len());
    for entry in &entries {
        let task = db.get_task(&entry.task_id)?;
        activities.push(ActivityItem {
            id: entry.id.clone(),
            activity_type: classify(entry).as_str().to_string(),
            user_id: Some(entry.user_id.clone()),
            task_id: Some(entry.task_id.clone()),
            task_title: task.as_ref().map(|t| t.title.clone()),
            task_status: task.as_ref().map(|t| t.status.as_str().to_string()),
            project_id: task.as_ref().and_then(|t| t.project_id.clone()),
            duration_minutes: current_duration_minutes(entry, now),
            status: entry.status.as_str().to_string(),
            note: entry.note.clone(),
            start_time: Some(entry.start_time.to_rfc3339()),
            end_time: entry.end_time.map(|t| t.to_rfc3339()),
            is_paused: entry.is_paused(),
            timestamp: entry.created_at.to_rfc3339(),
            is_placeholder: false,
            running_start_time: None,
        });
    }

    if activities.is_empty() && page == 1 {
        return placeholder_page(db, now, filter, per_page);
    }

    let last_page = if total == 0 {
        1
    } else {
        (total + per_page - 1) / per_page
    };

    Ok(TimelinePage {
        activities,
        total,
        page,
        per_page,
        last_page,
    })
}

fn placeholder_page(
    db: &Database,
    now: DateTime<Utc>,
    filter: &TimeLogFilter,
    per_page: i64,
) -> Result<TimelinePage, TimerError> {
    let tasks = db.recent_tasks(filter, per_page)?;

    let mut activities = Vec::with_capacity(tasks.len());
    for task in tasks {
        let logs = db.entries_for_task(&task.id)?;
        let total_minutes: i64 = logs
            .iter()
            .map(|log| current_duration_minutes(log, now))
            .sum();
        let running_start_time = logs
            .iter()
            .filter(|log| log.is_running())
            .max_by_key(|log| log.start_time)
            .map(|log| log.start_time.to_rfc3339());

        activities.push(ActivityItem {
            id: format!("task-{}", task.id),
            activity_type: ActivityType::TaskCreated.as_str().to_string(),
            user_id: task.assigned_to.clone(),
            task_id: Some(task.id.clone()),
            task_title: Some(task.title.clone()),
            task_status: Some(task.status.as_str().to_string()),
            project_id: task.project_id.clone(),
            duration_minutes: total_minutes.max(0),
            status: LogStatus::Pending.as_str().to_string(),
            note: Some("No time logged yet.".to_string()),
            start_time: Some(task.created_at.to_rfc3339()),
            end_time: None,
            is_paused: false,
            timestamp: task.created_at.to_rfc3339(),
            is_placeholder: true,
            running_start_time,
        });
    }

    let total = activities.len() as i64;
    Ok(TimelinePage {
        activities,
        total,
        page: 1,
        per_page,
        last_page: 1,
    })
}

/// Timesheet summary over every matched entry. `duration_minutes` is
/// already net of pauses once stop has run, so it is summed as-is.
pub fn timesheet(
    db: &Database,
    filter: &TimeLogFilter,
    by_day: bool,
) -> Result<TimesheetSummary, TimerError> {
    let entries = db.list_entries(filter)?;
    let total_minutes: i64 = entries.iter().map(|e| e.duration_minutes).sum();
    let by_day = if by_day {
        Some(group_by_day(&entries))
    } else {
        None
    };

    Ok(TimesheetSummary {
        total_minutes,
        total_hours: minutes_to_hours(total_minutes),
        total_logs: entries.len(),
        by_day,
        entries: entries.iter().map(TimeLogView::from_entry).collect(),
    })
}

fn group_by_day(entries: &[TimeLogEntry]) -> Vec<DayTotal> {
    let mut days: BTreeMap<NaiveDate, (i64, usize)> = BTreeMap::new();
    for entry in entries {
        let day = days.entry(entry.start_time.date_naive()).or_default();
        day.0 += entry.duration_minutes;
        day.1 += 1;
    }

    days.into_iter()
        .map(|(date, (total_minutes, entry_count))| DayTotal {
            date: date.format("%Y-%m-%d").to_string(),
            total_minutes,
            entry_count,
        })
        .collect()
}

/// Per-task report: every entry newest-first, with the rollup convention
/// (approved entries only) for the totals.
pub fn task_report(db: &Database, task_id: &str) -> Result<TaskTimeReport, TimerError> {
    let entries = db.entries_for_task(task_id)?;
    let total_minutes: i64 = entries
        .iter()
        .filter(|e| e.status == LogStatus::Approved)
        .map(|e| e.duration_minutes)
        .sum();

    Ok(TaskTimeReport {
        total_minutes,
        total_hours: minutes_to_hours(total_minutes),
        entries: entries.iter().map(TimeLogView::from_entry).collect(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::models::{Task, TaskStatus};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn entry_at(start: DateTime<Utc>) -> TimeLogEntry {
        TimeLogEntry {
            id: Ulid::new().to_string(),
            task_id: "task-1".to_string(),
            user_id: "alice".to_string(),
            start_time: start,
            end_time: None,
            duration_minutes: 0,
            paused_at: None,
            paused_duration_minutes: 0,
            note: None,
            status: LogStatus::Pending,
            source: Some(LogSource::Timer),
            created_at: start,
            updated_at: start,
        }
    }

    fn seed_task(db: &Database, id: &str) {
        db.insert_task(&Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            project_id: Some("proj-1".to_string()),
            assigned_to: Some("alice".to_string()),
            status: TaskStatus::InProgress,
            actual_time_minutes: 0,
            created_at: t0(),
        })
        .unwrap();
    }

    #[test]
    fn classification_follows_source_then_state() {
        let running = entry_at(t0());
        assert_eq!(classify(&running), ActivityType::TimerStarted);

        let mut paused = entry_at(t0());
        paused.paused_at = Some(t0() + Duration::minutes(5));
        assert_eq!(classify(&paused), ActivityType::TimerPaused);

        let mut stopped = entry_at(t0());
        stopped.end_time = Some(t0() + Duration::hours(1));
        stopped.duration_minutes = 60;
        assert_eq!(classify(&stopped), ActivityType::TimerStopped);

        let mut manual = entry_at(t0());
        manual.source = Some(LogSource::Manual);
        assert_eq!(classify(&manual), ActivityType::ManualEntry);

        // Manual wins even for a still-open record.
        assert!(manual.is_running());
    }

    #[test]
    fn legacy_rows_use_the_five_minute_heuristic() {
        // Terminated two minutes after creation: treated as manual.
        let mut quick = entry_at(t0());
        quick.source = None;
        quick.end_time = Some(t0() + Duration::minutes(2));
        quick.duration_minutes = 2;
        assert_eq!(classify(&quick), ActivityType::ManualEntry);

        // Terminated an hour later: a real timer.
        let mut slow = entry_at(t0());
        slow.source = None;
        slow.end_time = Some(t0() + Duration::hours(1));
        slow.duration_minutes = 60;
        assert_eq!(classify(&slow), ActivityType::TimerStopped);

        // Still running: the running rule applies.
        let mut open = entry_at(t0());
        open.source = None;
        assert_eq!(classify(&open), ActivityType::TimerStarted);
        open.paused_at = Some(t0() + Duration::minutes(1));
        assert_eq!(classify(&open), ActivityType::TimerPaused);
    }

    #[test]
    fn derived_duration_mirrors_the_stop_formula() {
        let now = t0() + Duration::seconds(130);

        // Running, 70s net after 60s of recorded pause -> 2 minutes.
        let mut running = entry_at(t0());
        running.paused_duration_minutes = 1;
        assert_eq!(current_duration_minutes(&running, now), 2);

        // Paused: the projection freezes at paused_at.
        let mut paused = entry_at(t0());
        paused.paused_at = Some(t0() + Duration::seconds(90));
        assert_eq!(current_duration_minutes(&paused, now), 2);

        // Terminated: the stored net value wins, whatever now is.
        let mut stopped = entry_at(t0());
        stopped.end_time = Some(t0() + Duration::seconds(130));
        stopped.duration_minutes = 2;
        stopped.paused_duration_minutes = 1;
        assert_eq!(current_duration_minutes(&stopped, now + Duration::hours(5)), 2);
    }

    #[test]
    fn timeline_pages_newest_creation_first() {
        let db = Database::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        seed_task(&db, "task-1");

        for i in 0..5 {
            let mut e = entry_at(t0() + Duration::minutes(i));
            e.end_time = Some(t0() + Duration::minutes(i + 30));
            e.duration_minutes = 30;
            db.insert_entry(&e).unwrap();
        }

        let filter = TimeLogFilter::default();
        let page = timeline(&db, &clock, &filter, 1, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, 2);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.activities.len(), 2);
        assert_eq!(page.activities[0].timestamp, (t0() + Duration::minutes(4)).to_rfc3339());
        assert!(!page.activities[0].is_placeholder);
        assert_eq!(page.activities[0].task_title.as_deref(), Some("Task task-1"));
        assert_eq!(page.activities[0].project_id.as_deref(), Some("proj-1"));

        let last = timeline(&db, &clock, &filter, 3, 2).unwrap();
        assert_eq!(last.activities.len(), 1);

        // An empty later page stays empty; the fallback is first-page only.
        let beyond = timeline(&db, &clock, &filter, 9, 2).unwrap();
        assert!(beyond.activities.is_empty());
        assert_eq!(beyond.total, 5);
    }

    #[test]
    fn empty_first_page_falls_back_to_placeholder_tasks() {
        let db = Database::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        seed_task(&db, "task-1");
        seed_task(&db, "task-2");

        let page = timeline(&db, &clock, &TimeLogFilter::default(), 1, 20).unwrap();
        assert_eq!(page.activities.len(), 2);
        assert!(page.activities.iter().all(|a| a.is_placeholder));
        assert!(page.activities.iter().all(|a| a.activity_type == "task_created"));
        assert_eq!(page.total, 2);
        assert_eq!(page.last_page, 1);
    }

    #[test]
    fn placeholder_sums_running_time_for_the_task() {
        let db = Database::open_in_memory().unwrap();
        seed_task(&db, "task-1");

        let mut open = entry_at(t0());
        open.user_id = "bob".to_string();
        db.insert_entry(&open).unwrap();

        let mut closed = entry_at(t0() - Duration::hours(2));
        closed.end_time = Some(t0() - Duration::hours(1));
        closed.duration_minutes = 60;
        db.insert_entry(&closed).unwrap();

        let clock = ManualClock::new(t0() + Duration::minutes(10));
        // No approved entries exist, so the feed is empty and falls back.
        let filter = TimeLogFilter {
            status: Some(LogStatus::Approved),
            ..Default::default()
        };
        let page = timeline(&db, &clock, &filter, 1, 20).unwrap();
        assert_eq!(page.activities.len(), 1);
        let item = &page.activities[0];
        assert!(item.is_placeholder);
        assert_eq!(item.id, "task-task-1");
        // 60 closed minutes plus 10 minutes on the open timer.
        assert_eq!(item.duration_minutes, 70);
        assert_eq!(item.running_start_time, Some(t0().to_rfc3339()));
    }

    #[test]
    fn timesheet_sums_net_durations_without_double_subtraction() {
        let db = Database::open_in_memory().unwrap();
        seed_task(&db, "task-1");

        // Stored duration is already net; the paused column must not be
        // subtracted again.
        let mut a = entry_at(t0());
        a.end_time = Some(t0() + Duration::minutes(13));
        a.duration_minutes = 10;
        a.paused_duration_minutes = 3;
        db.insert_entry(&a).unwrap();

        let mut b = entry_at(t0() + Duration::days(1));
        b.user_id = "bob".to_string();
        b.end_time = Some(t0() + Duration::days(1) + Duration::minutes(50));
        b.duration_minutes = 50;
        db.insert_entry(&b).unwrap();

        let sheet = timesheet(&db, &TimeLogFilter::default(), false).unwrap();
        assert_eq!(sheet.total_minutes, 60);
        assert_eq!(sheet.total_hours, 1.0);
        assert_eq!(sheet.total_logs, 2);
        assert!(sheet.by_day.is_none());
        assert_eq!(sheet.entries[0].duration_formatted, "00:50");

        let filtered = timesheet(
            &db,
            &TimeLogFilter {
                user_id: Some("alice".to_string()),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        assert_eq!(filtered.total_minutes, 10);
        assert_eq!(filtered.total_logs, 1);
    }

    #[test]
    fn timesheet_groups_by_calendar_date() {
        let db = Database::open_in_memory().unwrap();
        seed_task(&db, "task-1");

        for (day_offset, minutes) in [(0, 30), (0, 15), (1, 45)] {
            let start = t0() + Duration::days(day_offset);
            let mut e = entry_at(start);
            e.end_time = Some(start + Duration::minutes(minutes));
            e.duration_minutes = minutes;
            db.insert_entry(&e).unwrap();
        }

        let sheet = timesheet(&db, &TimeLogFilter::default(), true).unwrap();
        let days = sheet.by_day.unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, "2025-06-01");
        assert_eq!(days[0].total_minutes, 45);
        assert_eq!(days[0].entry_count, 2);
        assert_eq!(days[1].date, "2025-06-02");
        assert_eq!(days[1].total_minutes, 45);
        assert_eq!(days[1].entry_count, 1);
    }

    #[test]
    fn task_report_totals_approved_entries_only() {
        let db = Database::open_in_memory().unwrap();
        seed_task(&db, "task-1");

        for (minutes, status) in [
            (30, LogStatus::Approved),
            (45, LogStatus::Pending),
            (10, LogStatus::Rejected),
        ] {
            let mut e = entry_at(t0());
            e.user_id = Ulid::new().to_string();
            e.end_time = Some(t0() + Duration::minutes(minutes));
            e.duration_minutes = minutes;
            e.status = status;
            db.insert_entry(&e).unwrap();
        }

        let report = task_report(&db, "task-1").unwrap();
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.total_minutes, 30);
        assert_eq!(report.total_hours, 0.5);
    }
}
