mod approval;
mod clock;
mod db;
mod engine;
mod error;
mod models;
mod timeline;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use ulid::Ulid;

use clock::{Clock, SystemClock};
use db::{Database, TimeLogFilter};
use engine::{LogNotifier, TimerEngine};
use error::TimerError;
use models::{LogStatus, Task, TaskStatus, TaskView, TimeLogEntry, TimeLogView, format_duration};

#[derive(Parser, Debug)]
#[command(author, version, about = "Task time tracking with pause/resume and an approval workflow")]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Database file (default: $TLOG_DB or ~/.tlog/tlog.db)")]
    db: Option<PathBuf>,

    #[arg(long, global = true, value_name = "ID", help = "Acting user (default: $TLOG_USER)")]
    user: Option<String>,

    #[arg(long, global = true, help = "Emit JSON instead of human-readable output")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Start a timer on a task")]
    Start {
        task_id: String,
        #[arg(long, help = "Note attached to the entry")]
        note: Option<String>,
    },

    #[command(about = "Pause a running timer")]
    Pause { timer_id: String },

    #[command(about = "Resume a paused timer")]
    Resume { timer_id: String },

    #[command(about = "Stop a timer and record its duration")]
    Stop { timer_id: String },

    #[command(about = "Show your active timer, if any")]
    Active,

    #[command(about = "Record a manual time entry")]
    Manual {
        task_id: String,
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: NaiveDate,
        #[arg(long, value_name = "HH:MM")]
        from: String,
        #[arg(long, value_name = "HH:MM")]
        to: String,
        #[arg(long, help = "Override the derived duration in minutes")]
        duration: Option<i64>,
        #[arg(long)]
        note: Option<String>,
    },

    #[command(about = "Edit a pending entry's note or times")]
    Edit {
        entry_id: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DD", requires = "from", requires = "to")]
        date: Option<NaiveDate>,
        #[arg(long, value_name = "HH:MM", requires = "date")]
        from: Option<String>,
        #[arg(long, value_name = "HH:MM", requires = "date")]
        to: Option<String>,
    },

    #[command(about = "Delete a pending entry")]
    Delete { entry_id: String },

    #[command(about = "Summarize entries, with optional per-day totals")]
    Timesheet {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, help = "Group totals by calendar date")]
        by_day: bool,
    },

    #[command(about = "Activity feed, newest first")]
    Timeline {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        per_page: i64,
        #[arg(long, help = "Keep polling for new activity (Ctrl+C to stop)")]
        follow: bool,
    },

    #[command(about = "Per-task time report")]
    Task { task_id: String },

    #[command(about = "Approve a pending time log")]
    Approve { time_log_id: String },

    #[command(about = "Reject a pending time log")]
    Reject {
        time_log_id: String,
        #[arg(long)]
        reason: String,
    },

    #[command(about = "Report timers running longer than the threshold")]
    CheckLongRunning {
        #[arg(long, default_value_t = 8)]
        hours: i64,
    },

    #[command(subcommand, about = "Manage tasks")]
    Tasks(TasksCommand),
}

#[derive(Subcommand, Debug)]
enum TasksCommand {
    #[command(about = "Create a task")]
    Add {
        title: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value = "todo")]
        status: String,
    },

    #[command(about = "List tasks")]
    List,

    #[command(about = "Change a task's status, stopping or starting timers to match")]
    SetStatus { task_id: String, status: String },
}

#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
    #[arg(long, value_name = "YYYY-MM-DD")]
    from: Option<NaiveDate>,

    #[arg(long, value_name = "YYYY-MM-DD")]
    to: Option<NaiveDate>,

    #[arg(long, value_name = "ID")]
    project: Option<String>,

    #[arg(long, value_name = "STATUS", help = "Entry status: pending, approved, rejected")]
    status: Option<String>,

    #[arg(long, value_name = "STATUS", help = "Task status: todo, in_progress, review, done")]
    task_status: Option<String>,

    #[arg(long, help = "Include every user's entries, not just yours")]
    all_users: bool,
}

fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let db = match &cli.db {
        Some(path) => Database::open(path)?,
        None => Database::new()?,
    };
    let clock = SystemClock;
    let engine = TimerEngine::new(&db, &db, &clock);

    match &cli.command {
        Command::Start { task_id, note } => {
            let entry = engine.start(&acting_user(&cli)?, task_id, note.as_deref())?;
            emit_entry(&cli, &entry, &format!("✓ Timer started on {}", entry.task_id))
        }
        Command::Pause { timer_id } => {
            let entry = engine.pause(&acting_user(&cli)?, timer_id)?;
            emit_entry(&cli, &entry, "✓ Timer paused")
        }
        Command::Resume { timer_id } => {
            let entry = engine.resume(&acting_user(&cli)?, timer_id)?;
            emit_entry(&cli, &entry, "✓ Timer resumed")
        }
        Command::Stop { timer_id } => {
            let entry = engine.stop(&acting_user(&cli)?, timer_id)?;
            emit_entry(
                &cli,
                &entry,
                &format!("✓ Timer stopped ({})", format_duration(entry.duration_minutes)),
            )
        }
        Command::Active => {
            match engine.get_active(&acting_user(&cli)?)? {
                None => {
                    if cli.json {
                        println!("null");
                    } else {
                        println!("No active timer");
                    }
                }
                Some(active) => {
                    if cli.json {
                        let mut view = TimeLogView::from_entry(&active.entry);
                        view.current_duration_minutes = Some(active.current_duration_minutes);
                        println!("{}", serde_json::to_string_pretty(&view)?);
                    } else {
                        let state = if active.entry.is_paused() { "paused" } else { "running" };
                        println!(
                            "Timer {} on task {} ({}, {})",
                            active.entry.id,
                            active.entry.task_id,
                            state,
                            format_duration(active.current_duration_minutes)
                        );
                    }
                }
            }
            Ok(())
        }
        Command::Manual {
            task_id,
            date,
            from,
            to,
            duration,
            note,
        } => {
            let entry = engine.create_manual_entry(
                &acting_user(&cli)?,
                task_id,
                *date,
                parse_clock(from)?,
                parse_clock(to)?,
                *duration,
                note.as_deref(),
            )?;
            emit_entry(
                &cli,
                &entry,
                &format!("✓ Logged {} on {}", format_duration(entry.duration_minutes), entry.task_id),
            )
        }
        Command::Edit {
            entry_id,
            note,
            date,
            from,
            to,
        } => {
            let times = match (date, from, to) {
                (Some(d), Some(f), Some(t)) => Some((*d, parse_clock(f)?, parse_clock(t)?)),
                _ => None,
            };
            let entry = engine.update_entry(&acting_user(&cli)?, entry_id, note.as_deref(), times)?;
            emit_entry(&cli, &entry, "✓ Entry updated")
        }
        Command::Delete { entry_id } => {
            engine.delete_entry(&acting_user(&cli)?, entry_id)?;
            if !cli.json {
                println!("✓ Entry deleted");
            }
            Ok(())
        }
        Command::Timesheet { filter, by_day } => {
            let filter = build_filter(&cli, filter)?;
            let sheet = timeline::timesheet(&db, &filter, *by_day)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sheet)?);
                return Ok(());
            }
            for view in &sheet.entries {
                println!(
                    "{} {} [{}] {} {}",
                    &view.start_time[..10],
                    view.duration_formatted,
                    view.status,
                    view.task_id,
                    view.note.as_deref().unwrap_or("")
                );
            }
            if let Some(days) = &sheet.by_day {
                println!();
                for day in days {
                    println!(
                        "{}  {}  ({} entries)",
                        day.date,
                        format_duration(day.total_minutes),
                        day.entry_count
                    );
                }
            }
            println!(
                "Total: {} across {} entries ({:.2}h)",
                format_duration(sheet.total_minutes),
                sheet.total_logs,
                sheet.total_hours
            );
            Ok(())
        }
        Command::Timeline {
            filter,
            page,
            per_page,
            follow,
        } => {
            let filter = build_filter(&cli, filter)?;
            if *follow {
                return follow_timeline(&db, &clock, &filter, *per_page, cli.json);
            }
            let feed = timeline::timeline(&db, &clock, &filter, *page, *per_page)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&feed)?);
            } else {
                for item in &feed.activities {
                    print_activity(item);
                }
                println!(
                    "Page {}/{} ({} activities)",
                    feed.page, feed.last_page, feed.total
                );
            }
            Ok(())
        }
        Command::Task { task_id } => {
            let report = timeline::task_report(&db, task_id)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            for view in &report.entries {
                println!(
                    "{} {} [{}] {} {}",
                    &view.start_time[..16],
                    view.duration_formatted,
                    view.status,
                    view.user_id,
                    view.note.as_deref().unwrap_or("")
                );
            }
            println!(
                "Approved total: {} ({:.2}h)",
                format_duration(report.total_minutes),
                report.total_hours
            );
            Ok(())
        }
        Command::Approve { time_log_id } => {
            let entry = approval::approve(&db, &db, &clock, time_log_id, &acting_user(&cli)?)?;
            emit_entry(&cli, &entry, "✓ Time log approved")
        }
        Command::Reject { time_log_id, reason } => {
            let entry = approval::reject(&db, &clock, time_log_id, reason)?;
            emit_entry(&cli, &entry, "✓ Time log rejected")
        }
        Command::CheckLongRunning { hours } => {
            let reminders = engine.check_long_running(*hours, &LogNotifier)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reminders)?);
                return Ok(());
            }
            if reminders.is_empty() {
                println!("No timers running longer than {hours}h");
                return Ok(());
            }
            for r in &reminders {
                println!(
                    "{} user={} task={} running for {}h (since {})",
                    r.timer_id, r.user_id, r.task_id, r.hours_running, r.start_time
                );
            }
            Ok(())
        }
        Command::Tasks(cmd) => run_tasks(&cli, &db, &engine, cmd),
    }
}

fn run_tasks(
    cli: &Cli,
    db: &Database,
    engine: &TimerEngine,
    cmd: &TasksCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        TasksCommand::Add {
            title,
            project,
            assignee,
            status,
        } => {
            let status = parse_task_status(status)?;
            let task = Task {
                id: Ulid::new().to_string(),
                title: title.clone(),
                project_id: project.clone(),
                assigned_to: assignee.clone(),
                status,
                actual_time_minutes: 0,
                created_at: Utc::now(),
            };
            db.insert_task(&task)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&TaskView::from_task(&task))?);
            } else {
                println!("✓ Task created: {}", task.id);
            }
            Ok(())
        }
        TasksCommand::List => {
            let tasks = db.list_tasks()?;
            if cli.json {
                let views: Vec<TaskView> = tasks.iter().map(TaskView::from_task).collect();
                println!("{}", serde_json::to_string_pretty(&views)?);
                return Ok(());
            }
            for task in &tasks {
                println!(
                    "{} [{}] {} ({})",
                    task.id,
                    task.status.as_str(),
                    task.title,
                    format_duration(task.actual_time_minutes)
                );
            }
            Ok(())
        }
        TasksCommand::SetStatus { task_id, status } => {
            let status = parse_task_status(status)?;
            if !db.set_task_status(task_id, status)? {
                return Err(Box::new(TimerError::NotFound(format!(
                    "Task not found: {task_id}"
                ))));
            }
            engine.handle_task_status_change(task_id, status);
            if !cli.json {
                println!("✓ Task {} is now {}", task_id, status.as_str());
            }
            Ok(())
        }
    }
}

fn follow_timeline(
    db: &Database,
    clock: &dyn Clock,
    filter: &TimeLogFilter,
    per_page: i64,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let feed = timeline::timeline(db, clock, filter, 1, per_page)?;
    let mut seen = String::new();
    for item in feed.activities.iter().rev() {
        if item.timestamp > seen {
            seen = item.timestamp.clone();
        }
        if json {
            println!("{}", serde_json::to_string(item)?);
        } else {
            print_activity(item);
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let _ = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        let feed = timeline::timeline(db, clock, filter, 1, per_page)?;
        // Timestamps are RFC 3339 in UTC, so string order is time order.
        let mut fresh: Vec<_> = feed
            .activities
            .iter()
            .filter(|a| !a.is_placeholder && a.timestamp > seen)
            .collect();
        fresh.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        for item in fresh {
            seen = item.timestamp.clone();
            if json {
                println!("{}", serde_json::to_string(item)?);
            } else {
                print_activity(item);
            }
        }

        thread::sleep(StdDuration::from_millis(500));
    }

    Ok(())
}

fn print_activity(item: &models::ActivityItem) {
    let title = item.task_title.as_deref().unwrap_or("<unknown task>");
    let user = item.user_id.as_deref().unwrap_or("-");
    println!(
        "{} [{}] {} {} {}{}",
        &item.timestamp[..19],
        item.activity_type,
        user,
        title,
        format_duration(item.duration_minutes),
        if item.is_paused { " (paused)" } else { "" }
    );
}

fn emit_entry(cli: &Cli, entry: &TimeLogEntry, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&TimeLogView::from_entry(entry))?);
    } else {
        println!("{message}");
    }
    Ok(())
}

fn acting_user(cli: &Cli) -> Result<String, TimerError> {
    if let Some(user) = &cli.user {
        return Ok(user.clone());
    }
    if let Ok(user) = std::env::var("TLOG_USER") {
        if !user.is_empty() {
            return Ok(user);
        }
    }
    Err(TimerError::Validation(
        "No user given. Pass --user or set TLOG_USER.".to_string(),
    ))
}

fn build_filter(cli: &Cli, args: &FilterArgs) -> Result<TimeLogFilter, TimerError> {
    let status = args
        .status
        .as_deref()
        .map(|s| {
            LogStatus::parse(s)
                .ok_or_else(|| TimerError::Validation(format!("Unknown entry status: {s}")))
        })
        .transpose()?;
    let task_status = args
        .task_status
        .as_deref()
        .map(parse_task_status)
        .transpose()?;

    let user_id = if args.all_users {
        None
    } else {
        // Reports default to the acting user when one is known.
        match acting_user(cli) {
            Ok(user) => Some(user),
            Err(_) => None,
        }
    };

    Ok(TimeLogFilter {
        user_id,
        project_id: args.project.clone(),
        from: args.from,
        to: args.to,
        status,
        task_status,
    })
}

fn parse_task_status(s: &str) -> Result<TaskStatus, TimerError> {
    TaskStatus::parse(s)
        .ok_or_else(|| TimerError::Validation(format!("Unknown task status: {s}")))
}

fn parse_clock(s: &str) -> Result<NaiveTime, TimerError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| TimerError::Validation(format!("Invalid time of day: {s} (expected HH:MM)")))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn edit_time_flags_only_parse_as_a_full_triple() {
        // A lone flag must be rejected, not silently ignored downstream.
        assert!(Cli::try_parse_from(["tlog", "edit", "e1", "--from", "09:00"]).is_err());
        assert!(Cli::try_parse_from(["tlog", "edit", "e1", "--to", "10:00"]).is_err());
        assert!(Cli::try_parse_from(["tlog", "edit", "e1", "--date", "2025-06-02"]).is_err());
        assert!(Cli::try_parse_from([
            "tlog", "edit", "e1", "--date", "2025-06-02", "--from", "09:00", "--to", "10:00",
        ])
        .is_ok());

        // A note-only edit stays valid.
        assert!(Cli::try_parse_from(["tlog", "edit", "e1", "--note", "fixed"]).is_ok());
    }
}
