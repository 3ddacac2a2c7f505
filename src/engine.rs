use chrono::{Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use log::{error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::TimerError;
use crate::models::{
    LogSource, LogStatus, LongRunningReminder, TaskStatus, TimeLogEntry,
};

/// Task state consulted by the engine. The engine never owns task state; it
/// reads status/assignee and writes the rolled-up actual time back through
/// this port.
pub trait TaskGate {
    fn task_status(&self, task_id: &str) -> Result<Option<TaskStatus>, TimerError>;
    fn task_assignee(&self, task_id: &str) -> Result<Option<String>, TimerError>;
    fn set_actual_time(&self, task_id: &str, minutes: i64) -> Result<(), TimerError>;
}

impl TaskGate for Database {
    fn task_status(&self, task_id: &str) -> Result<Option<TaskStatus>, TimerError> {
        Ok(self.get_task(task_id)?.map(|t| t.status))
    }

    fn task_assignee(&self, task_id: &str) -> Result<Option<String>, TimerError> {
        Ok(self.get_task(task_id)?.and_then(|t| t.assigned_to))
    }

    fn set_actual_time(&self, task_id: &str, minutes: i64) -> Result<(), TimerError> {
        self.set_task_actual_time(task_id, minutes)
    }
}

/// Outbound port for long-running timer signals. Delivery is someone else's
/// problem; the engine fires and forgets.
pub trait NotificationSink {
    fn notify_long_running(&self, entry: &TimeLogEntry, hours_running: i64);
}

pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify_long_running(&self, entry: &TimeLogEntry, hours_running: i64) {
        warn!(
            "long-running timer: id={} user={} task={} running for {}h (started {})",
            entry.id,
            entry.user_id,
            entry.task_id,
            hours_running,
            entry.start_time.to_rfc3339()
        );
    }
}

/// An active timer plus its derived, non-persisted current duration.
#[derive(Debug)]
pub struct ActiveTimer {
    pub entry: TimeLogEntry,
    pub current_duration_minutes: i64,
}

pub struct TimerEngine<'a> {
    db: &'a Database,
    tasks: &'a dyn TaskGate,
    clock: &'a dyn Clock,
}

impl<'a> TimerEngine<'a> {
    pub fn new(db: &'a Database, tasks: &'a dyn TaskGate, clock: &'a dyn Clock) -> Self {
        TimerEngine { db, tasks, clock }
    }

    /// Starts a timer for the user on the given task. The task must be in
    /// progress and the user must not already hold an open entry; the whole
    /// check-then-insert runs in one transaction, with the store's partial
    /// unique index backing up the check.
    pub fn start(
        &self,
        user_id: &str,
        task_id: &str,
        note: Option<&str>,
    ) -> Result<TimeLogEntry, TimerError> {
        self.db.tx(|| {
            match self.tasks.task_status(task_id)? {
                None => {
                    return Err(TimerError::NotFound(format!("Task not found: {task_id}")));
                }
                Some(TaskStatus::InProgress) => {}
                Some(_) => {
                    return Err(TimerError::InvalidState(
                        "Timer can only be started for tasks with status \"In Progress\""
                            .to_string(),
                    ));
                }
            }

            if self.db.get_active_for_user(user_id)?.is_some() {
                return Err(TimerError::Conflict(
                    "You already have an active timer. Please stop it first.".to_string(),
                ));
            }

            let now = self.clock.now();
            let entry = TimeLogEntry {
                id: Ulid::new().to_string(),
                task_id: task_id.to_string(),
                user_id: user_id.to_string(),
                start_time: now,
                end_time: None,
                duration_minutes: 0,
                paused_at: None,
                paused_duration_minutes: 0,
                note: note.map(|n| n.to_string()),
                status: LogStatus::Pending,
                source: Some(LogSource::Timer),
                created_at: now,
                updated_at: now,
            };
            self.db.insert_entry(&entry)?;
            Ok(entry)
        })
    }

    pub fn pause(&self, user_id: &str, timer_id: &str) -> Result<TimeLogEntry, TimerError> {
        self.db.tx(|| {
            let entry = self.load_owned(timer_id, user_id)?;
            if !entry.is_running() {
                return Err(TimerError::InvalidState(
                    "Timer is already stopped".to_string(),
                ));
            }
            if entry.is_paused() {
                return Err(TimerError::InvalidState(
                    "Timer is already paused".to_string(),
                ));
            }

            let now = self.clock.now();
            if !self.db.mark_paused(&entry.id, now, now)? {
                return Err(TimerError::InvalidState(
                    "Timer is already paused".to_string(),
                ));
            }
            self.load_owned(timer_id, user_id)
        })
    }

    pub fn resume(&self, user_id: &str, timer_id: &str) -> Result<TimeLogEntry, TimerError> {
        self.db.tx(|| {
            let entry = self.load_owned(timer_id, user_id)?;
            if !entry.is_running() {
                return Err(TimerError::InvalidState(
                    "Timer is already stopped".to_string(),
                ));
            }
            let paused_at = entry
                .paused_at
                .ok_or_else(|| TimerError::InvalidState("Timer is not paused".to_string()))?;

            let now = self.clock.now();
            // Whole minutes, truncated
            let paused = (now - paused_at).num_minutes().max(0);
            let total = entry.paused_duration_minutes + paused;
            if !self.db.mark_resumed(&entry.id, total, now)? {
                return Err(TimerError::InvalidState("Timer is not paused".to_string()));
            }
            self.load_owned(timer_id, user_id)
        })
    }

    pub fn stop(&self, user_id: &str, timer_id: &str) -> Result<TimeLogEntry, TimerError> {
        self.db.tx(|| {
            let entry = self.load_owned(timer_id, user_id)?;
            if !entry.is_running() {
                return Err(TimerError::InvalidState(
                    "Timer is already stopped".to_string(),
                ));
            }
            self.stop_entry(&entry)
        })
    }

    // Stop computation shared by explicit stop, the self-healing read, and
    // the task-status coupling. Caller supplies the transaction.
    fn stop_entry(&self, entry: &TimeLogEntry) -> Result<TimeLogEntry, TimerError> {
        let now = self.clock.now();
        let total_seconds = (now - entry.start_time).num_seconds().max(0);

        // Fold any open pause interval in seconds, so one rounding step
        // covers the whole paused total.
        let mut paused_seconds = entry.paused_duration_minutes * 60;
        let mut paused_minutes = entry.paused_duration_minutes;
        if let Some(paused_at) = entry.paused_at {
            paused_seconds += (now - paused_at).num_seconds().max(0);
            paused_minutes = (paused_seconds + 30) / 60;
        }

        let net_seconds = (total_seconds - paused_seconds).max(0);
        // Ceiling: any positive net duration bills at least one minute,
        // zero net stays zero.
        let duration_minutes = (net_seconds + 59) / 60;

        if !self
            .db
            .close_entry(&entry.id, now, duration_minutes, paused_minutes)?
        {
            return Err(TimerError::InvalidState(
                "Timer is already stopped".to_string(),
            ));
        }

        let stopped = self
            .db
            .get_entry(&entry.id)?
            .ok_or_else(|| TimerError::NotFound(format!("Timer not found: {}", entry.id)))?;

        // Administrative backfill: an entry approved before it was stopped
        // needs its task rollup immediately.
        if stopped.status == LogStatus::Approved {
            crate::approval::update_task_actual_time(self.db, self.tasks, &stopped.task_id)?;
        }

        Ok(stopped)
    }

    /// The user's active timer, if any. Self-healing: an open entry whose
    /// task is no longer in progress is stopped here and reported as "no
    /// active timer".
    pub fn get_active(&self, user_id: &str) -> Result<Option<ActiveTimer>, TimerError> {
        let Some(entry) = self.db.get_active_for_user(user_id)? else {
            return Ok(None);
        };

        if self.tasks.task_status(&entry.task_id)? != Some(TaskStatus::InProgress) {
            info!(
                "auto-stopping timer {}: task {} is no longer in progress",
                entry.id, entry.task_id
            );
            self.db.tx(|| self.stop_entry(&entry))?;
            return Ok(None);
        }

        let now = self.clock.now();
        let elapsed = (now - entry.start_time).num_minutes();
        let current = (elapsed - entry.paused_duration_minutes).max(0);
        Ok(Some(ActiveTimer {
            entry,
            current_duration_minutes: current,
        }))
    }

    /// Records an already-terminated entry from wall-clock input. The span
    /// is interpreted in the local timezone; the end must be strictly after
    /// the start.
    #[allow(clippy::too_many_arguments)]
    pub fn create_manual_entry(
        &self,
        user_id: &str,
        task_id: &str,
        date: NaiveDate,
        start_clock: NaiveTime,
        end_clock: NaiveTime,
        duration_minutes: Option<i64>,
        note: Option<&str>,
    ) -> Result<TimeLogEntry, TimerError> {
        if self.tasks.task_status(task_id)?.is_none() {
            return Err(TimerError::NotFound(format!("Task not found: {task_id}")));
        }
        if end_clock <= start_clock {
            return Err(TimerError::Validation(
                "End time must be after start time".to_string(),
            ));
        }

        let start_time = local_to_utc(date, start_clock)?;
        let end_time = local_to_utc(date, end_clock)?;
        let duration = match duration_minutes {
            Some(minutes) if minutes < 0 => {
                return Err(TimerError::Validation(
                    "Duration must not be negative".to_string(),
                ));
            }
            Some(minutes) => minutes,
            None => (end_time - start_time).num_minutes(),
        };

        let now = self.clock.now();
        let entry = TimeLogEntry {
            id: Ulid::new().to_string(),
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            start_time,
            end_time: Some(end_time),
            duration_minutes: duration,
            paused_at: None,
            paused_duration_minutes: 0,
            note: note.map(|n| n.to_string()),
            status: LogStatus::Pending,
            source: Some(LogSource::Manual),
            created_at: now,
            updated_at: now,
        };
        self.db.insert_entry(&entry)?;
        Ok(entry)
    }

    /// Pending-only edit by the owning user. Notes are always editable;
    /// times only on terminated entries (the duration is re-derived from
    /// the new span and the pause accounting reset alongside it).
    pub fn update_entry(
        &self,
        user_id: &str,
        entry_id: &str,
        note: Option<&str>,
        times: Option<(NaiveDate, NaiveTime, NaiveTime)>,
    ) -> Result<TimeLogEntry, TimerError> {
        self.db.tx(|| {
            let entry = self.load_owned(entry_id, user_id)?;
            if entry.status != LogStatus::Pending {
                return Err(TimerError::InvalidState(
                    "Only pending entries can be edited".to_string(),
                ));
            }

            let now = self.clock.now();

            if let Some((date, start_clock, end_clock)) = times {
                if entry.is_running() {
                    return Err(TimerError::InvalidState(
                        "Cannot edit the times of a running timer".to_string(),
                    ));
                }
                if end_clock <= start_clock {
                    return Err(TimerError::Validation(
                        "End time must be after start time".to_string(),
                    ));
                }
                let start_time = local_to_utc(date, start_clock)?;
                let end_time = local_to_utc(date, end_clock)?;
                let duration = (end_time - start_time).num_minutes();
                self.db
                    .update_times(&entry.id, start_time, end_time, duration, now)?;
            }

            if let Some(note) = note {
                self.db.update_note(&entry.id, Some(note), now)?;
            }

            self.load_owned(entry_id, user_id)
        })
    }

    /// Pending-only delete by the owning user.
    pub fn delete_entry(&self, user_id: &str, entry_id: &str) -> Result<(), TimerError> {
        self.db.tx(|| {
            let entry = self.load_owned(entry_id, user_id)?;
            if entry.status != LogStatus::Pending {
                return Err(TimerError::InvalidState(
                    "Only pending entries can be deleted".to_string(),
                ));
            }
            self.db.delete_entry(&entry.id)
        })
    }

    /// Best-effort coupling to task status changes. Moving to done stops
    /// every open entry on the task; moving to in-progress starts a timer
    /// for the assignee, stopping any timer they already hold. Failures are
    /// logged and swallowed so the status change itself never aborts.
    pub fn handle_task_status_change(&self, task_id: &str, new_status: TaskStatus) {
        match new_status {
            TaskStatus::Done => self.stop_open_entries_for_task(task_id),
            TaskStatus::InProgress => self.start_for_assignee(task_id),
            _ => {}
        }
    }

    fn stop_open_entries_for_task(&self, task_id: &str) {
        let entries = match self.db.open_entries_for_task(task_id) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to load open timers for task {task_id}: {e}");
                return;
            }
        };

        for entry in entries {
            if let Err(e) = self.db.tx(|| self.stop_entry(&entry)) {
                error!("failed to auto-stop timer {} for task {task_id}: {e}", entry.id);
            }
        }
    }

    fn start_for_assignee(&self, task_id: &str) {
        let result = (|| -> Result<(), TimerError> {
            let Some(user_id) = self.tasks.task_assignee(task_id)? else {
                return Ok(());
            };
            // Stop first, then start: the single-timer invariant survives
            // the automation.
            if let Some(active) = self.db.get_active_for_user(&user_id)? {
                self.db.tx(|| self.stop_entry(&active))?;
            }
            self.start(&user_id, task_id, None)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!("failed to auto-start timer for task {task_id}: {e}");
        }
    }

    /// Scans for timers open longer than `max_hours` and signals each one
    /// through the notification port.
    pub fn check_long_running(
        &self,
        max_hours: i64,
        sink: &dyn NotificationSink,
    ) -> Result<Vec<LongRunningReminder>, TimerError> {
        let now = self.clock.now();
        let cutoff = now - Duration::hours(max_hours);
        let timers = self.db.open_entries_started_before(cutoff)?;

        let mut reminders = Vec::with_capacity(timers.len());
        for entry in timers {
            let hours_running = (now - entry.start_time).num_hours();
            sink.notify_long_running(&entry, hours_running);

            let task_title = self.db.get_task(&entry.task_id)?.map(|t| t.title);
            reminders.push(LongRunningReminder {
                timer_id: entry.id,
                user_id: entry.user_id,
                task_id: entry.task_id,
                task_title,
                hours_running,
                start_time: entry.start_time.to_rfc3339(),
            });
        }
        Ok(reminders)
    }

    fn load_owned(&self, entry_id: &str, user_id: &str) -> Result<TimeLogEntry, TimerError> {
        self.db
            .get_entry_for_user(entry_id, user_id)?
            .ok_or_else(|| TimerError::NotFound(format!("Timer not found: {entry_id}")))
    }
}

fn local_to_utc(date: NaiveDate, time: NaiveTime) -> Result<chrono::DateTime<Utc>, TimerError> {
    Local
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            TimerError::Validation(format!("Invalid or ambiguous local time: {date} {time}"))
        })
}
