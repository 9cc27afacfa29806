use chrono::Local;
use env_logger::{Builder, Target};
use log::{Level, LevelFilter};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

pub const ENABLE_LOGS_ENV: &str = "SWITCHYARD_ENABLE_LOGS";
pub const RETENTION_ENV: &str = "SWITCHYARD_LOG_RETENTION_HOURS";

const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 3_600);

/// Mirror of console output into a per-run file.
struct RunLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

static RUN_LOG: OnceLock<Option<RunLog>> = OnceLock::new();

#[derive(Debug, PartialEq)]
struct LogOptions {
    to_file: bool,
    retention: Duration,
    warnings: Vec<String>,
}

impl LogOptions {
    fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut warnings = Vec::new();

        let mut to_file = cfg!(debug_assertions);
        if let Some(raw) = lookup(ENABLE_LOGS_ENV) {
            match parse_flag(&raw) {
                Some(flag) => to_file = flag,
                None => warnings.push(format!(
                    "Ignoring {ENABLE_LOGS_ENV}={raw:?}; expected a boolean"
                )),
            }
        }

        let retention = match lookup(RETENTION_ENV) {
            None => DEFAULT_RETENTION,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(hours) => Duration::from_secs(hours.saturating_mul(3_600)),
                Err(_) => {
                    warnings.push(format!(
                        "Ignoring {RETENTION_ENV}={raw:?}; keeping logs for {}h",
                        DEFAULT_RETENTION.as_secs() / 3_600
                    ));
                    DEFAULT_RETENTION
                }
            },
        };

        Self {
            to_file,
            retention,
            warnings,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
        .join("logs")
}

/// File receiving this run's log lines, when file logging is on.
pub fn run_log_path() -> Option<&'static Path> {
    RUN_LOG
        .get()
        .and_then(Option::as_ref)
        .map(|run| run.path.as_path())
}

fn open_run_log(dir: &Path, retention: Duration, warnings: &mut Vec<String>) -> Option<RunLog> {
    if let Err(e) = fs::create_dir_all(dir) {
        warnings.push(format!("Cannot create log directory {}: {e}", dir.display()));
        return None;
    }
    warnings.extend(prune_logs(dir, retention));

    let path = dir.join(format!("switchyard-{}.log", Local::now().format("%Y%m%d-%H%M%S")));
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(RunLog {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        }),
        Err(e) => {
            warnings.push(format!(
                "Cannot open log file {}: {e}; logging to stderr only",
                path.display()
            ));
            None
        }
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Installs the global logger. Later calls are no-ops.
///
/// Console output always goes to stderr since stdout carries the bridge
/// protocol. `RUST_LOG` replaces the default per-crate filters.
pub fn init_logging() {
    let mut options = LogOptions::from_env();
    let mut first = false;
    let run_log = RUN_LOG.get_or_init(|| {
        first = true;
        options
            .to_file
            .then(|| open_run_log(&log_dir(), options.retention, &mut options.warnings))
            .flatten()
    });
    if !first {
        return;
    }

    let mut builder = Builder::new();
    builder.is_test(cfg!(test)).target(Target::Stderr);
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder
                .filter_level(LevelFilter::Warn)
                .filter_module("switchyard", LevelFilter::Debug)
                .filter_module("pty_host", LevelFilter::Debug)
                .filter_module("portable_pty", LevelFilter::Info);
        }
    }
    builder.format(|buf, record| {
        let line = format!(
            "[{} {} {}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level_label(record.level()),
            record.target(),
            record.args()
        );
        if let Some(run) = RUN_LOG.get().and_then(Option::as_ref) {
            let mut writer = run.writer.lock();
            let _ = writeln!(writer, "{line}");
            let _ = writer.flush();
        }
        writeln!(buf, "{line}")
    });
    if builder.try_init().is_err() {
        return;
    }

    match run_log {
        Some(run) => log::info!("Writing logs to {} (pid {})", run.path.display(), std::process::id()),
        None => log::info!("File logging off (pid {})", std::process::id()),
    }
    for warning in options.warnings {
        log::warn!("{warning}");
    }
}

/// Deletes `*.log` files in `dir` last modified before `retention` ago.
/// Returns a warning per file that could not be inspected or removed.
fn prune_logs(dir: &Path, retention: Duration) -> Vec<String> {
    let Some(cutoff) = (!retention.is_zero())
        .then(|| SystemTime::now().checked_sub(retention))
        .flatten()
    else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|path| {
            let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(_) => return Some(format!("Cannot read age of {}", path.display())),
            };
            if modified >= cutoff {
                return None;
            }
            fs::remove_file(&path)
                .err()
                .map(|e| format!("Cannot delete stale log {}: {e}", path.display()))
        })
        .collect()
}
