use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Pending,
    Approved,
    Rejected,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Approved => "approved",
            LogStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LogStatus::Pending),
            "approved" => Some(LogStatus::Approved),
            "rejected" => Some(LogStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Timer,
    Manual,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Timer => "timer",
            LogSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timer" => Some(LogSource::Timer),
            "manual" => Some(LogSource::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "review" => Some(TaskStatus::Review),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

/// One timer or manual time-tracking session. Plain data; derived values
/// (current duration, formatted duration) are computed on read.
#[derive(Debug, Clone)]
pub struct TimeLogEntry {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_duration_minutes: i64,
    pub note: Option<String>,
    pub status: LogStatus,
    // None on rows written before the source column existed
    pub source: Option<LogSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeLogEntry {
    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub project_id: Option<String>,
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    pub actual_time_minutes: i64,
    pub created_at: DateTime<Utc>,
}

/// "HH:MM" rendering of a minute count.
pub fn format_duration(minutes: i64) -> String {
    let minutes = minutes.max(0);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn minutes_to_hours(minutes: i64) -> f64 {
    (minutes as f64 / 60.0 * 100.0).round() / 100.0
}

/// Serialized form of an entry. Timestamps are RFC 3339,
/// `duration_formatted` is the "HH:MM" convenience field.
#[derive(Debug, Clone, Serialize)]
pub struct TimeLogView {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_minutes: i64,
    pub duration_formatted: String,
    pub paused_at: Option<String>,
    pub paused_duration_minutes: i64,
    pub is_paused: bool,
    pub note: Option<String>,
    pub status: String,
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_duration_minutes: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl TimeLogView {
    pub fn from_entry(entry: &TimeLogEntry) -> Self {
        TimeLogView {
            id: entry.id.clone(),
            task_id: entry.task_id.clone(),
            user_id: entry.user_id.clone(),
            start_time: entry.start_time.to_rfc3339(),
            end_time: entry.end_time.map(|t| t.to_rfc3339()),
            duration_minutes: entry.duration_minutes,
            duration_formatted: format_duration(entry.duration_minutes),
            paused_at: entry.paused_at.map(|t| t.to_rfc3339()),
            paused_duration_minutes: entry.paused_duration_minutes,
            is_paused: entry.is_paused(),
            note: entry.note.clone(),
            status: entry.status.as_str().to_string(),
            source: entry.source.map(|s| s.as_str().to_string()),
            current_duration_minutes: None,
            created_at: entry.created_at.to_rfc3339(),
            updated_at: entry.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub title: String,
    pub project_id: Option<String>,
    pub assigned_to: Option<String>,
    pub status: String,
    pub actual_time_minutes: i64,
    pub created_at: String,
}

impl TaskView {
    pub fn from_task(task: &Task) -> Self {
        TaskView {
            id: task.id.clone(),
            title: task.title.clone(),
            project_id: task.project_id.clone(),
            assigned_to: task.assigned_to.clone(),
            status: task.status.as_str().to_string(),
            actual_time_minutes: task.actual_time_minutes,
            created_at: task.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    TimerStarted,
    TimerPaused,
    TimerStopped,
    ManualEntry,
    TaskCreated,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::TimerStarted => "timer_started",
            ActivityType::TimerPaused => "timer_paused",
            ActivityType::TimerStopped => "timer_stopped",
            ActivityType::ManualEntry => "manual_entry",
            ActivityType::TaskCreated => "task_created",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub id: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub task_title: Option<String>,
    pub task_status: Option<String>,
    pub project_id: Option<String>,
    pub duration_minutes: i64,
    pub status: String,
    pub note: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub is_paused: bool,
    pub timestamp: String,
    pub is_placeholder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_start_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimelinePage {
    pub activities: Vec<ActivityItem>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub last_page: i64,
}

#[derive(Debug, Serialize)]
pub struct DayTotal {
    pub date: String,
    pub total_minutes: i64,
    pub entry_count: usize,
}

#[derive(Debug, Serialize)]
pub struct TimesheetSummary {
    pub entries: Vec<TimeLogView>,
    pub total_minutes: i64,
    pub total_hours: f64,
    pub total_logs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_day: Option<Vec<DayTotal>>,
}

#[derive(Debug, Serialize)]
pub struct TaskTimeReport {
    pub entries: Vec<TimeLogView>,
    pub total_minutes: i64,
    pub total_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LongRunningReminder {
    pub timer_id: String,
    pub user_id: String,
    pub task_id: String,
    pub task_title: Option<String>,
    pub hours_running: i64,
    pub start_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_pads_hours_and_minutes() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(5), "00:05");
        assert_eq!(format_duration(90), "01:30");
        assert_eq!(format_duration(600), "10:00");
        assert_eq!(format_duration(6010), "100:10");
    }

    #[test]
    fn format_duration_clamps_negative() {
        assert_eq!(format_duration(-3), "00:00");
    }

    #[test]
    fn minutes_to_hours_rounds_to_two_places() {
        assert_eq!(minutes_to_hours(90), 1.5);
        assert_eq!(minutes_to_hours(100), 1.67);
        assert_eq!(minutes_to_hours(0), 0.0);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [LogStatus::Pending, LogStatus::Approved, LogStatus::Rejected] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LogStatus::parse("bogus"), None);
    }
}
