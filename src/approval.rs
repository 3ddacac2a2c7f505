use log::info;

use crate::clock::Clock;
use crate::db::Database;
use crate::engine::TaskGate;
use crate::error::TimerError;
use crate::models::{LogStatus, TimeLogEntry};

/// Approves a completed entry and recomputes the owning task's rollup.
/// Only `pending` entries may transition, and a running timer cannot be
/// approved.
pub fn approve(
    db: &Database,
    tasks: &dyn TaskGate,
    clock: &dyn Clock,
    time_log_id: &str,
    approver_id: &str,
) -> Result<TimeLogEntry, TimerError> {
    db.tx(|| {
        let entry = load(db, time_log_id)?;
        require_pending(&entry)?;
        if entry.end_time.is_none() {
            return Err(TimerError::InvalidState(
                "Cannot approve a running timer. Stop it first.".to_string(),
            ));
        }

        db.update_status(&entry.id, LogStatus::Approved, entry.note.as_deref(), clock.now())?;
        update_task_actual_time(db, tasks, &entry.task_id)?;
        info!("time log {} approved by {}", entry.id, approver_id);

        load(db, time_log_id)
    })
}

/// Rejects a pending entry, appending the reason to the note for
/// auditability. Prior notes are never overwritten.
pub fn reject(
    db: &Database,
    clock: &dyn Clock,
    time_log_id: &str,
    rejection_reason: &str,
) -> Result<TimeLogEntry, TimerError> {
    db.tx(|| {
        let entry = load(db, time_log_id)?;
        require_pending(&entry)?;

        let note = match &entry.note {
            Some(existing) => format!("{existing}\n\nRejection reason: {rejection_reason}"),
            None => format!("Rejection reason: {rejection_reason}"),
        };
        db.update_status(&entry.id, LogStatus::Rejected, Some(&note), clock.now())?;

        load(db, time_log_id)
    })
}

/// Recomputes a task's `actual_time_minutes` as the sum of its approved
/// entries' durations. Shared with the engine's administrative-backfill
/// path in stop.
pub fn update_task_actual_time(
    db: &Database,
    tasks: &dyn TaskGate,
    task_id: &str,
) -> Result<(), TimerError> {
    let total = db.approved_minutes_for_task(task_id)?;
    tasks.set_actual_time(task_id, total)
}

fn load(db: &Database, time_log_id: &str) -> Result<TimeLogEntry, TimerError> {
    db.get_entry(time_log_id)?
        .ok_or_else(|| TimerError::NotFound(format!("Time log not found: {time_log_id}")))
}

// Approved and rejected are both terminal.
fn require_pending(entry: &TimeLogEntry) -> Result<(), TimerError> {
    match entry.status {
        LogStatus::Pending => Ok(()),
        LogStatus::Approved => Err(TimerError::InvalidState(
            "Time log is already approved".to_string(),
        )),
        LogStatus::Rejected => Err(TimerError::InvalidState(
            "Time log is already rejected".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::engine::TimerEngine;
    use crate::models::{Task, TaskStatus};

    fn setup() -> (Database, ManualClock) {
        let db = Database::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        db.insert_task(&Task {
            id: "task-1".to_string(),
            title: "Review PR".to_string(),
            project_id: None,
            assigned_to: Some("alice".to_string()),
            status: TaskStatus::InProgress,
            actual_time_minutes: 0,
            created_at: clock.now(),
        })
        .unwrap();
        (db, clock)
    }

    fn finished_entry(db: &Database, clock: &ManualClock, minutes: i64) -> TimeLogEntry {
        let engine = TimerEngine::new(db, db, clock);
        let started = engine.start("alice", "task-1", None).unwrap();
        clock.advance_mins(minutes);
        engine.stop("alice", &started.id).unwrap()
    }

    #[test]
    fn approve_rolls_duration_up_to_the_task() {
        let (db, clock) = setup();
        let first = finished_entry(&db, &clock, 30);
        let second = finished_entry(&db, &clock, 20);

        let approved = approve(&db, &db, &clock, &first.id, "boss").unwrap();
        assert_eq!(approved.status, LogStatus::Approved);
        assert_eq!(
            db.get_task("task-1").unwrap().unwrap().actual_time_minutes,
            30
        );

        approve(&db, &db, &clock, &second.id, "boss").unwrap();
        assert_eq!(
            db.get_task("task-1").unwrap().unwrap().actual_time_minutes,
            50
        );
    }

    #[test]
    fn approve_requires_a_stopped_entry() {
        let (db, clock) = setup();
        let engine = TimerEngine::new(&db, &db, &clock);
        let running = engine.start("alice", "task-1", None).unwrap();

        let err = approve(&db, &db, &clock, &running.id, "boss").unwrap_err();
        assert!(matches!(err, TimerError::InvalidState(_)));

        // Still pending, still running.
        let read = db.get_entry(&running.id).unwrap().unwrap();
        assert_eq!(read.status, LogStatus::Pending);
        assert!(read.end_time.is_none());
    }

    #[test]
    fn terminal_statuses_stay_terminal() {
        let (db, clock) = setup();
        let entry = finished_entry(&db, &clock, 10);

        approve(&db, &db, &clock, &entry.id, "boss").unwrap();
        let err = approve(&db, &db, &clock, &entry.id, "boss").unwrap_err();
        assert!(matches!(err, TimerError::InvalidState(_)));
        let err = reject(&db, &clock, &entry.id, "changed my mind").unwrap_err();
        assert!(matches!(err, TimerError::InvalidState(_)));

        let other = finished_entry(&db, &clock, 10);
        reject(&db, &clock, &other.id, "wrong task").unwrap();
        let err = reject(&db, &clock, &other.id, "again").unwrap_err();
        assert!(matches!(err, TimerError::InvalidState(_)));
        let err = approve(&db, &db, &clock, &other.id, "boss").unwrap_err();
        assert!(matches!(err, TimerError::InvalidState(_)));
    }

    #[test]
    fn reject_appends_reason_without_clobbering_the_note() {
        let (db, clock) = setup();
        let engine = TimerEngine::new(&db, &db, &clock);

        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let entry = engine
            .create_manual_entry(
                "alice",
                "task-1",
                date,
                start,
                end,
                None,
                Some("worked offsite"),
            )
            .unwrap();

        let rejected = reject(&db, &clock, &entry.id, "no ticket reference").unwrap();
        assert_eq!(rejected.status, LogStatus::Rejected);
        assert_eq!(
            rejected.note.as_deref(),
            Some("worked offsite\n\nRejection reason: no ticket reference")
        );

        // No prior note: the reason stands alone.
        let bare = finished_entry(&db, &clock, 5);
        let rejected = reject(&db, &clock, &bare.id, "duplicate").unwrap();
        assert_eq!(
            rejected.note.as_deref(),
            Some("Rejection reason: duplicate")
        );
    }

    #[test]
    fn rejected_entries_never_reach_the_rollup() {
        let (db, clock) = setup();
        let keep = finished_entry(&db, &clock, 25);
        let discard = finished_entry(&db, &clock, 90);

        approve(&db, &db, &clock, &keep.id, "boss").unwrap();
        reject(&db, &clock, &discard.id, "padding").unwrap();

        assert_eq!(
            db.get_task("task-1").unwrap().unwrap().actual_time_minutes,
            25
        );
    }

    #[test]
    fn approving_a_missing_entry_is_not_found() {
        let (db, clock) = setup();
        let err = approve(&db, &db, &clock, "nope", "boss").unwrap_err();
        assert!(matches!(err, TimerError::NotFound(_)));
    }
}
