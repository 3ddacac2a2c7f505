use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use dirs::home_dir;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::TimerError;
use crate::models::{LogSource, LogStatus, Task, TaskStatus, TimeLogEntry};

const CURRENT_VERSION: i32 = 2;

const ENTRY_COLUMNS: &str = "id, task_id, user_id, start_time, end_time, duration_minutes, \
     paused_at, paused_duration_minutes, note, status, source, created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, title, project_id, assigned_to, status, actual_time_minutes, created_at";

/// Filters shared by the timesheet and timeline queries. Project and task
/// status filters reach through the tasks table.
#[derive(Debug, Default, Clone)]
pub struct TimeLogFilter {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<LogStatus>,
    pub task_status: Option<TaskStatus>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new() -> Result<Self, TimerError> {
        let db_path = Self::default_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::open(&db_path)
    }

    pub fn open(path: &Path) -> Result<Self, TimerError> {
        let conn = Connection::open(path)?;
        let mut db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, TimerError> {
        let conn = Connection::open_in_memory()?;
        let mut db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TLOG_DB") {
            return PathBuf::from(path);
        }
        if let Some(home) = home_dir() {
            home.join(".tlog").join("tlog.db")
        } else {
            let uid = std::process::id();
            PathBuf::from(format!("/tmp/tlog_{}.db", uid))
        }
    }

    fn init_schema(&mut self) -> Result<(), TimerError> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version == 0 {
            self.create_initial_schema()?;
        }

        if version != 0 && version < CURRENT_VERSION {
            self.migrate_to_v2()?;
        }

        Ok(())
    }

    fn create_initial_schema(&self) -> Result<(), TimerError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS time_logs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_minutes INTEGER NOT NULL DEFAULT 0,
                paused_at TEXT,
                paused_duration_minutes INTEGER NOT NULL DEFAULT 0,
                note TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                source TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                project_id TEXT,
                assigned_to TEXT,
                status TEXT NOT NULL DEFAULT 'todo',
                actual_time_minutes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_task ON time_logs(task_id);
            CREATE INDEX IF NOT EXISTS idx_logs_user ON time_logs(user_id);
            CREATE INDEX IF NOT EXISTS idx_logs_status ON time_logs(status);
            CREATE INDEX IF NOT EXISTS idx_logs_start ON time_logs(start_time);
            CREATE INDEX IF NOT EXISTS idx_logs_created ON time_logs(created_at);

            -- Storage-level guarantee of the one-open-entry-per-user rule
            CREATE UNIQUE INDEX IF NOT EXISTS uniq_active_timer
                ON time_logs(user_id) WHERE end_time IS NULL;

            PRAGMA user_version = {CURRENT_VERSION};"
        ))?;

        Ok(())
    }

    // Early databases predate the source column; their rows stay NULL and
    // are classified heuristically by the timeline layer.
    fn migrate_to_v2(&self) -> Result<(), TimerError> {
        let column_exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('time_logs') WHERE name = 'source'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0) > 0;

        if !column_exists {
            self.conn
                .execute("ALTER TABLE time_logs ADD COLUMN source TEXT", [])?;
        }

        self.conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uniq_active_timer
                 ON time_logs(user_id) WHERE end_time IS NULL;
             PRAGMA user_version = {CURRENT_VERSION};"
        ))?;

        Ok(())
    }

    /// Runs `f` inside a BEGIN IMMEDIATE transaction so check-then-act
    /// sequences (start, stop, pause, resume) commit or roll back as one
    /// unit.
    pub fn tx<T>(
        &self,
        f: impl FnOnce() -> Result<T, TimerError>,
    ) -> Result<T, TimerError> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        match f() {
            Ok(value) => {
                self.conn.execute_batch("COMMIT;")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                Err(e)
            }
        }
    }

    // ---- time log entries ----

    pub fn insert_entry(&self, entry: &TimeLogEntry) -> Result<(), TimerError> {
        let result = self.conn.execute(
            &format!("INSERT INTO time_logs ({ENTRY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                entry.id,
                entry.task_id,
                entry.user_id,
                entry.start_time.to_rfc3339(),
                entry.end_time.map(|t| t.to_rfc3339()),
                entry.duration_minutes,
                entry.paused_at.map(|t| t.to_rfc3339()),
                entry.paused_duration_minutes,
                entry.note,
                entry.status.as_str(),
                entry.source.map(|s| s.as_str()),
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            // The partial unique index rejects a second open entry for the
            // same user; surface that as the single-active-timer conflict.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(TimerError::Conflict(
                    "You already have an active timer. Please stop it first.".to_string(),
                ))
            }
            Err(e) => Err(TimerError::Storage(e)),
        }
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<TimeLogEntry>, TimerError> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM time_logs WHERE id = ?"),
                params![id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get_entry_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<TimeLogEntry>, TimerError> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM time_logs WHERE id = ? AND user_id = ?"),
                params![id, user_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get_active_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<TimeLogEntry>, TimerError> {
        let entry = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM time_logs WHERE user_id = ? AND end_time IS NULL"
                ),
                params![user_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn open_entries_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<TimeLogEntry>, TimerError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_logs WHERE task_id = ? AND end_time IS NULL"
        ))?;
        let entries = stmt
            .query_map(params![task_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn open_entries_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TimeLogEntry>, TimerError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_logs
             WHERE end_time IS NULL AND start_time < ?
             ORDER BY start_time ASC"
        ))?;
        let entries = stmt
            .query_map(params![cutoff.to_rfc3339()], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Guarded pause write. Returns false when the entry is no longer
    /// running or is already paused.
    pub fn mark_paused(
        &self,
        id: &str,
        paused_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, TimerError> {
        let rows = self.conn.execute(
            "UPDATE time_logs SET paused_at = ?, updated_at = ?
             WHERE id = ? AND end_time IS NULL AND paused_at IS NULL",
            params![paused_at.to_rfc3339(), now.to_rfc3339(), id],
        )?;
        Ok(rows == 1)
    }

    /// Guarded resume write. Returns false when the entry is not paused.
    pub fn mark_resumed(
        &self,
        id: &str,
        paused_duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, TimerError> {
        let rows = self.conn.execute(
            "UPDATE time_logs SET paused_at = NULL, paused_duration_minutes = ?, updated_at = ?
             WHERE id = ? AND end_time IS NULL AND paused_at IS NOT NULL",
            params![paused_duration_minutes, now.to_rfc3339(), id],
        )?;
        Ok(rows == 1)
    }

    /// Terminates an entry. The `end_time IS NULL` guard makes a second
    /// concurrent stop a no-op; the loser sees false.
    pub fn close_entry(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
        duration_minutes: i64,
        paused_duration_minutes: i64,
    ) -> Result<bool, TimerError> {
        let rows = self.conn.execute(
            "UPDATE time_logs
             SET end_time = ?, duration_minutes = ?, paused_at = NULL,
                 paused_duration_minutes = ?, updated_at = ?
             WHERE id = ? AND end_time IS NULL",
            params![
                end_time.to_rfc3339(),
                duration_minutes,
                paused_duration_minutes,
                end_time.to_rfc3339(),
                id
            ],
        )?;
        Ok(rows == 1)
    }

    pub fn update_note(
        &self,
        id: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TimerError> {
        self.conn.execute(
            "UPDATE time_logs SET note = ?, updated_at = ? WHERE id = ?",
            params![note, now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Rewrites a terminated entry's span. The edited span carries no pause
    /// information, so the new duration is net by definition and the pause
    /// accounting is cleared with it.
    pub fn update_times(
        &self,
        id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<(), TimerError> {
        self.conn.execute(
            "UPDATE time_logs SET start_time = ?, end_time = ?, duration_minutes = ?,
                 paused_duration_minutes = 0, updated_at = ?
             WHERE id = ?",
            params![
                start_time.to_rfc3339(),
                end_time.to_rfc3339(),
                duration_minutes,
                now.to_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn update_status(
        &self,
        id: &str,
        status: LogStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TimerError> {
        self.conn.execute(
            "UPDATE time_logs SET status = ?, note = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), note, now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn delete_entry(&self, id: &str) -> Result<(), TimerError> {
        self.conn
            .execute("DELETE FROM time_logs WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn entries_for_task(&self, task_id: &str) -> Result<Vec<TimeLogEntry>, TimerError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_logs WHERE task_id = ? ORDER BY start_time DESC"
        ))?;
        let entries = stmt
            .query_map(params![task_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn approved_minutes_for_task(&self, task_id: &str) -> Result<i64, TimerError> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_minutes), 0) FROM time_logs
             WHERE task_id = ? AND status = 'approved'",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn filter_clause(filter: &TimeLogFilter) -> (String, Vec<String>) {
        let mut clause = String::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(user_id) = &filter.user_id {
            clause.push_str(" AND user_id = ?");
            params.push(user_id.clone());
        }

        if let Some(project_id) = &filter.project_id {
            clause.push_str(" AND task_id IN (SELECT id FROM tasks WHERE project_id = ?)");
            params.push(project_id.clone());
        }

        if let Some(from) = &filter.from {
            clause.push_str(" AND date(start_time) >= ?");
            params.push(from.format("%Y-%m-%d").to_string());
        }

        if let Some(to) = &filter.to {
            clause.push_str(" AND date(start_time) <= ?");
            params.push(to.format("%Y-%m-%d").to_string());
        }

        if let Some(status) = &filter.status {
            clause.push_str(" AND status = ?");
            params.push(status.as_str().to_string());
        }

        if let Some(task_status) = &filter.task_status {
            clause.push_str(" AND task_id IN (SELECT id FROM tasks WHERE status = ?)");
            params.push(task_status.as_str().to_string());
        }

        (clause, params)
    }

    /// Timesheet query: every match, newest start first.
    pub fn list_entries(&self, filter: &TimeLogFilter) -> Result<Vec<TimeLogEntry>, TimerError> {
        let (clause, params) = Self::filter_clause(filter);
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM time_logs WHERE 1=1{clause} ORDER BY start_time DESC"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();

        let entries = stmt
            .query_map(&param_refs[..], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_entries(&self, filter: &TimeLogFilter) -> Result<i64, TimerError> {
        let (clause, params) = Self::filter_clause(filter);
        let query = format!("SELECT COUNT(*) FROM time_logs WHERE 1=1{clause}");

        let mut stmt = self.conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();

        let count: i64 = stmt.query_row(&param_refs[..], |row| row.get(0))?;
        Ok(count)
    }

    /// Timeline page: creation order, newest first.
    pub fn list_entries_page(
        &self,
        filter: &TimeLogFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TimeLogEntry>, TimerError> {
        let (clause, params) = Self::filter_clause(filter);
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM time_logs WHERE 1=1{clause}
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .chain(std::iter::once(&limit as &dyn rusqlite::ToSql))
            .chain(std::iter::once(&offset as &dyn rusqlite::ToSql))
            .collect();

        let entries = stmt
            .query_map(&param_refs[..], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- tasks ----

    pub fn insert_task(&self, task: &Task) -> Result<(), TimerError> {
        self.conn.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                task.id,
                task.title,
                task.project_id,
                task.assigned_to,
                task.status.as_str(),
                task.actual_time_minutes,
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, TimerError> {
        let task = self
            .conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, TimerError> {
        let rows = self.conn.execute(
            "UPDATE tasks SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )?;
        Ok(rows == 1)
    }

    pub fn set_task_actual_time(&self, id: &str, minutes: i64) -> Result<(), TimerError> {
        self.conn.execute(
            "UPDATE tasks SET actual_time_minutes = ? WHERE id = ?",
            params![minutes, id],
        )?;
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, TimerError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Recently-created tasks for the timeline placeholder fallback.
    pub fn recent_tasks(
        &self,
        filter: &TimeLogFilter,
        limit: i64,
    ) -> Result<Vec<Task>, TimerError> {
        let mut query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(user_id) = &filter.user_id {
            query.push_str(" AND assigned_to = ?");
            params.push(user_id.clone());
        }

        if let Some(project_id) = &filter.project_id {
            query.push_str(" AND project_id = ?");
            params.push(project_id.clone());
        }

        if let Some(task_status) = &filter.task_status {
            query.push_str(" AND status = ?");
            params.push(task_status.as_str().to_string());
        }

        if let Some(from) = &filter.from {
            query.push_str(" AND date(created_at) >= ?");
            params.push(from.format("%Y-%m-%d").to_string());
        }

        if let Some(to) = &filter.to {
            query.push_str(" AND date(created_at) <= ?");
            params.push(to.format("%Y-%m-%d").to_string());
        }

        query.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut stmt = self.conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .chain(std::iter::once(&limit as &dyn rusqlite::ToSql))
            .collect();

        let tasks = stmt
            .query_map(&param_refs[..], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

fn parse_ts(value: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<TimeLogEntry> {
    let status: String = row.get(9)?;
    let source: Option<String> = row.get(10)?;

    Ok(TimeLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        start_time: parse_ts(row.get(3)?, 3)?,
        end_time: row
            .get::<_, Option<String>>(4)?
            .map(|t| parse_ts(t, 4))
            .transpose()?,
        duration_minutes: row.get(5)?,
        paused_at: row
            .get::<_, Option<String>>(6)?
            .map(|t| parse_ts(t, 6))
            .transpose()?,
        paused_duration_minutes: row.get(7)?,
        note: row.get(8)?,
        status: LogStatus::parse(&status).unwrap_or(LogStatus::Pending),
        source: source.as_deref().and_then(LogSource::parse),
        created_at: parse_ts(row.get(11)?, 11)?,
        updated_at: parse_ts(row.get(12)?, 12)?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        project_id: row.get(2)?,
        assigned_to: row.get(3)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Todo),
        actual_time_minutes: row.get(5)?,
        created_at: parse_ts(row.get(6)?, 6)?,
    })
}
