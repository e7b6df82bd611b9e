//! Application log: a bounded in-memory view of recent lines, persisted as
//! JSON lines with size-based rotation. Every line is scrubbed of secrets
//! before it is stored.

pub mod commands;
pub mod redact;

pub use redact::{sanitize, TargetRedactor};
pub(crate) use redact::sanitize_json;

use crate::tunnel::{TunnelEvent, TunnelStatus};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lines kept in the in-memory view
const MAX_VIEW_LINES: usize = 10_000;

/// Live log file size that triggers rotation (5 MB)
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Rotated files kept beside the live one; `.log.1` is the newest
const ROTATED_GENERATIONS: usize = 3;

/// Maximum total bundle size (10 MB)
const MAX_BUNDLE_SIZE: u64 = 10 * 1024 * 1024;

const LOG_FILE_NAME: &str = "cloud-connector.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which part of the app a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSubsystem {
    Tunnel,
    Health,
    Sftp,
    App,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Unix milliseconds
    pub timestamp: i64,
    pub level: LogLevel,
    pub subsystem: LogSubsystem,
    /// Wire-encoded tunnel key the line is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogLine {
    pub fn new(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            subsystem,
            tunnel: None,
            message: sanitize(&message.into()),
            details: None,
        }
    }

    pub fn with_tunnel(mut self, key: impl Into<String>) -> Self {
        self.tunnel = Some(key.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(sanitize_json(&details));
        self
    }
}

/// Query over the in-memory view. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub tunnel: Option<String>,
    pub level: Option<LogLevel>,
    pub subsystem: Option<LogSubsystem>,
    /// Case-insensitive substring of the message
    pub search: Option<String>,
    /// Unix milliseconds
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugBundleOptions {
    pub max_lines: Option<u32>,
    pub include_config: Option<bool>,
    pub include_tunnels: Option<bool>,
    /// Replace instance names, projects and zones with placeholders
    pub redact_targets: Option<bool>,
}

/// Build and host facts written into a debug bundle
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
    pub profile: &'static str,
    pub generated_at: i64,
}

impl AppInfo {
    pub fn collect() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            profile: if cfg!(debug_assertions) { "debug" } else { "release" },
            generated_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl LogFilter {
    pub fn matches(&self, line: &LogLine) -> bool {
        self.tunnel.as_ref().map_or(true, |key| line.tunnel.as_ref() == Some(key))
            && self.level.map_or(true, |level| line.level == level)
            && self.subsystem.as_ref().map_or(true, |subsystem| &line.subsystem == subsystem)
            && self.since.map_or(true, |since| line.timestamp >= since)
            && self.search.as_ref().map_or(true, |search| {
                line.message.to_lowercase().contains(&search.to_lowercase())
            })
    }
}

/// Append-only JSONL file that rotates itself once it grows past `max_size`
struct LogFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_size: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path, generation: usize) -> PathBuf {
    path.with_extension(format!("log.{}", generation))
}

impl LogFile {
    fn open(path: PathBuf, max_size: u64) -> io::Result<Self> {
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file: Some(file),
            size,
            max_size,
        })
    }

    fn append(&mut self, json: &str) -> io::Result<()> {
        if self.size > 0 && self.size + json.len() as u64 >= self.max_size {
            self.rotate()?;
        }
        if self.file.is_none() {
            // A previous failure closed the file; try again
            self.file = Some(open_append(&self.path)?);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log file is not open"))?;
        if let Err(e) = writeln!(file, "{}", json) {
            self.file = None;
            return Err(e);
        }
        self.size += json.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        for generation in (1..ROTATED_GENERATIONS).rev() {
            let from = rotated_path(&self.path, generation);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.path, generation + 1))?;
            }
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))?;
        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }
}

/// Read the newest `MAX_VIEW_LINES` parseable lines of an existing log file
fn read_log_file(path: &Path) -> io::Result<VecDeque<LogLine>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e),
    };

    let mut lines = VecDeque::with_capacity(MAX_VIEW_LINES);
    let mut skipped = 0usize;
    for raw in BufReader::new(file).lines() {
        match serde_json::from_str::<LogLine>(&raw?) {
            Ok(line) => {
                if lines.len() == MAX_VIEW_LINES {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "Skipped unreadable log lines");
    }
    Ok(lines)
}

/// Recent log lines in memory, backed by a rotating file under `{config_dir}/logs`
pub struct LogManager {
    view: RwLock<VecDeque<LogLine>>,
    file: Mutex<LogFile>,
    logs_dir: PathBuf,
}

impl LogManager {
    pub fn new(config_dir: PathBuf) -> io::Result<Arc<Self>> {
        Self::with_max_file_size(config_dir, MAX_LOG_FILE_SIZE)
    }

    fn with_max_file_size(config_dir: PathBuf, max_file_size: u64) -> io::Result<Arc<Self>> {
        let logs_dir = config_dir.join("logs");
        fs::create_dir_all(&logs_dir)?;
        let path = logs_dir.join(LOG_FILE_NAME);

        let view = read_log_file(&path)?;
        let file = LogFile::open(path, max_file_size)?;

        Ok(Arc::new(Self {
            view: RwLock::new(view),
            file: Mutex::new(file),
            logs_dir,
        }))
    }

    /// Record a line. A line that can't be persisted still reaches the view.
    pub fn log(&self, entry: LogLine) {
        match serde_json::to_string(&entry) {
            Ok(json) => {
                let mut file = self.file.lock();
                if let Err(e) = file.append(&json) {
                    tracing::warn!(path = %file.path.display(), "Failed to persist log line: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode log line: {}", e),
        }

        let mut view = self.view.write();
        if view.len() == MAX_VIEW_LINES {
            view.pop_front();
        }
        view.push_back(entry);
    }

    /// The newest `max_lines` lines matching `filter`, oldest first
    pub fn get_recent_logs(&self, max_lines: u32, filter: Option<LogFilter>) -> Vec<LogLine> {
        let view = self.view.read();
        let mut recent: Vec<LogLine> = view
            .iter()
            .rev()
            .filter(|line| filter.as_ref().map_or(true, |f| f.matches(line)))
            .take(max_lines as usize)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Empty the in-memory view. The files are kept.
    pub fn clear_view(&self) {
        self.view.write().clear();
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }
}

static LOG_MANAGER: OnceCell<Arc<LogManager>> = OnceCell::new();

/// Install the process-wide log manager. Fails if one is already installed.
pub fn init_log_manager(config_dir: PathBuf) -> io::Result<()> {
    LOG_MANAGER
        .set(LogManager::new(config_dir)?)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "Log manager already initialized"))
}

pub fn get_log_manager() -> Option<&'static Arc<LogManager>> {
    LOG_MANAGER.get()
}

/// Helper to log a message (convenience function)
pub fn log(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) {
    if let Some(manager) = get_log_manager() {
        manager.log(LogLine::new(level, subsystem, message));
    }
}

/// Helper to log a line about one tunnel
pub fn log_tunnel(
    level: LogLevel,
    subsystem: LogSubsystem,
    key: impl Into<String>,
    message: impl Into<String>,
) {
    if let Some(manager) = get_log_manager() {
        manager.log(LogLine::new(level, subsystem, message).with_tunnel(key));
    }
}

/// Record a registry transition in the app log
pub fn record_tunnel_event(manager: &LogManager, event: &TunnelEvent) {
    let (level, message) = match (&event.status, &event.entry) {
        (TunnelStatus::Error, Some(entry)) => (
            LogLevel::Error,
            format!("Tunnel error: {}", entry.error.as_deref().unwrap_or("unknown")),
        ),
        (TunnelStatus::Connected, Some(entry)) => (
            LogLevel::Info,
            format!("Tunnel connected on local port {}", entry.local_port.unwrap_or_default()),
        ),
        (TunnelStatus::Connecting, _) => (LogLevel::Info, "Tunnel connecting".to_string()),
        (_, None) => (LogLevel::Info, "Tunnel disconnected".to_string()),
        (status, Some(_)) => (LogLevel::Debug, format!("Tunnel is {:?}", status)),
    };

    let mut line = LogLine::new(level, LogSubsystem::Tunnel, message).with_tunnel(event.key.to_string());
    if let (TunnelStatus::Connecting, Some(entry)) = (&event.status, &event.entry) {
        line = line.with_details(serde_json::json!({
            "target": entry.key.target(),
            "project": entry.project,
            "zone": entry.zone,
        }));
    }
    manager.log(line);
}
