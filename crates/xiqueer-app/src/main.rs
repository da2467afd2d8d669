//! Xiqueer Catch - capture weekly timetables from the campus app.
//!
//! Runs a local proxy that records the timetable responses the app fetches,
//! keeps one snapshot per academic week, and exports the merged timetable as
//! CSV.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use directories::{ProjectDirs, UserDirs};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xiqueer_app::settings::KNOWN_KEYS;
use xiqueer_app::{
    parse_config_value, CapturePipeline, CaptureService, CaptureSettings, SettingsOverrides,
};
use xiqueer_core::{export_rows, merge, ScheduleSnapshot};
use xiqueer_proxy::{CaptureState, CaptureStateCell, NoopProtector};
use xiqueer_storage::Database;

/// Xiqueer Catch - timetable capture proxy
#[derive(Parser, Debug)]
#[command(name = "xiqueer-catch", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Database file (defaults to the app data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture proxy until Ctrl-C
    Capture {
        /// Port to listen on (0 picks a free port)
        #[arg(long)]
        port: Option<u16>,

        /// Host serving the timetable
        #[arg(long)]
        target_host: Option<String>,

        /// Path fragment of the timetable request
        #[arg(long)]
        target_path: Option<String>,

        /// Resolve this host to IPv4 only (repeatable)
        #[arg(long = "force-ipv4")]
        force_ipv4: Vec<String>,
    },

    /// List captured snapshots by semester
    List,

    /// Merge snapshots and write them as CSV
    Export {
        /// Snapshot ids to export (default: all)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,

        /// Only export this semester, e.g. 2025-1
        #[arg(long, conflicts_with = "ids")]
        semester: Option<String>,

        /// Output directory (default: Downloads, or the current directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Delete all captured snapshots
    Clear,

    /// Manage stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show one setting, or all of them
    Get { key: Option<String> },
    /// Store a setting (JSON, or a plain string)
    Set { key: String, value: String },
    /// Remove a setting
    Unset { key: String },
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "xiqueer", "xiqueer-catch")
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Logs to stdout and to a daily file under the data directory.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let level = if args.debug { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xiqueer={}", level)));

    let appender = logs_dir().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("xiqueer-catch")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_writer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false)))
        .init();

    if guard.is_none() {
        tracing::warn!("File logging unavailable, using console only");
    }
    guard
}

fn open_database(path: Option<&Path>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("failed to open the snapshot database")
}

/// What the console has already been told about the capture state.
#[derive(Debug, Default)]
struct ConsoleReport {
    captured: u64,
    error: Option<String>,
}

impl ConsoleReport {
    /// Returns the new capture count and the new error, each only if it
    /// changed since the last call.
    fn observe(&mut self, state: &CaptureState) -> (Option<u64>, Option<String>) {
        let captured = (state.captured_count != self.captured).then(|| {
            self.captured = state.captured_count;
            self.captured
        });

        let error = if state.last_error != self.error {
            self.error = state.last_error.clone();
            self.error.clone()
        } else {
            None
        };

        (captured, error)
    }
}

async fn run_capture(db: Database, overrides: SettingsOverrides) -> anyhow::Result<()> {
    let settings = CaptureSettings::load(&db)?.with_overrides(overrides);
    tracing::info!(
        "Capturing {}{} (IPv4 only: {:?})",
        settings.target_host,
        settings.target_path_part,
        settings.force_ipv4_hosts
    );

    let state = CaptureStateCell::new();
    let pipeline = CapturePipeline::new(db, state.clone(), &settings);
    let service = CaptureService::new(&settings, pipeline, state.clone(), Arc::new(NoopProtector));

    let port = service.start_capture()?;
    println!("Proxy listening on 127.0.0.1:{}", port);
    println!("Point the device's HTTP proxy here, open the timetable, then press Ctrl-C.");

    let mut updates = state.subscribe();
    let mut console = ConsoleReport::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = updates.borrow_and_update().clone();
                let (captured, error) = console.observe(&now);
                if let Some(count) = captured {
                    println!("Captured {} week(s) so far", count);
                }
                if let Some(error) = error {
                    eprintln!("Error: {}", error);
                }
            }
        }
    }

    service.stop_capture().await;
    println!("Stopped after {} capture(s)", console.captured);
    Ok(())
}

fn run_list(db: &Database) -> anyhow::Result<()> {
    let groups = db.grouped_snapshots()?;
    if groups.is_empty() {
        println!("No snapshots captured yet.");
        return Ok(());
    }

    for group in groups {
        println!("{} [{}]", group.title, group.key);
        for snapshot in &group.snapshots {
            println!(
                "  #{:<4} week {:>2}/{:<2}  {} courses  {} ~ {}  captured {}",
                snapshot.id,
                snapshot.week_no,
                snapshot.max_week,
                snapshot.courses.len(),
                snapshot.period_start,
                snapshot.period_end,
                snapshot
                    .captured_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

fn select_snapshots(
    db: &Database,
    ids: &[i64],
    semester: Option<&str>,
) -> anyhow::Result<Vec<ScheduleSnapshot>> {
    if !ids.is_empty() {
        return Ok(db.get_snapshots_by_ids(ids)?);
    }

    let all = db.list_snapshots()?;
    Ok(match semester {
        Some(key) => all.into_iter().filter(|s| s.semester_key() == key).collect(),
        None => all,
    })
}

fn default_export_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run_export(
    db: &Database,
    ids: &[i64],
    semester: Option<&str>,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let snapshots = select_snapshots(db, ids, semester)?;
    let rows = merge(&snapshots);
    let dir = out.unwrap_or_else(default_export_dir);

    let result = export_rows(&dir, &rows);
    if !result.success {
        bail!(
            "export failed: {}",
            result.message.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!(
        "Exported {} rows from {} snapshots to {}",
        rows.len(),
        snapshots.len(),
        result.path
    );
    Ok(())
}

fn run_config(db: &Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key: Some(key) } => match db.get_config(&key)? {
            Some(config) => println!("{} = {}", config.key, config.value),
            None => println!("{} is not set", key),
        },
        ConfigAction::Get { key: None } => {
            for config in db.list_config()? {
                println!("{} = {}", config.key, config.value);
            }
        }
        ConfigAction::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!("{} is not a setting the capture host reads", key);
            }
            let value = parse_config_value(&value);
            db.set_config(&key, &value)?;
            println!("{} = {}", key, value);
        }
        ConfigAction::Unset { key } => {
            if db.delete_config(&key)? {
                println!("{} removed", key);
            } else {
                println!("{} was not set", key);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Xiqueer Catch v{}", env!("CARGO_PKG_VERSION"));
    let db = open_database(args.db.as_deref())?;

    match args.command {
        Command::Capture {
            port,
            target_host,
            target_path,
            force_ipv4,
        } => {
            let overrides = SettingsOverrides {
                target_host,
                target_path_part: target_path,
                force_ipv4_hosts: force_ipv4,
                bind_port: port,
            };
            run_capture(db, overrides).await
        }
        Command::List => run_list(&db),
        Command::Export { ids, semester, out } => {
            run_export(&db, &ids, semester.as_deref(), out)
        }
        Command::Clear => {
            let deleted = db.clear_snapshots()?;
            println!("Deleted {} snapshots", deleted);
            Ok(())
        }
        Command::Config { action } => run_config(&db, action),
    }
}
