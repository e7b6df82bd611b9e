use super::{
    get_log_manager, sanitize_json, AppInfo, DebugBundleOptions, LogFilter, LogLevel, LogLine, LogManager,
    LogSubsystem, TargetRedactor, MAX_BUNDLE_SIZE,
};
use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tunnel::TunnelEntry;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// Maximum lines to include in debug bundle
const MAX_BUNDLE_LINES: u32 = 10_000;

/// Directories a bundle is never written into
const FORBIDDEN_PREFIXES: &[&str] = &["/bin", "/boot", "/etc", "/proc", "/sbin", "/sys", "/usr"];

const README: &str = r#"Cloud Connector Debug Bundle
============================

This bundle contains sanitized debug information for troubleshooting.

Contents:
- logs.jsonl: Recent application logs (sanitized)
- app_info.json: Application version and system information
- config_snapshot.json: Settings snapshot (secrets redacted)
- tunnels.json: Tunnel states at export time (no credentials)

Private keys, OAuth tokens, passwords and authorization headers are
redacted automatically. Instance names, projects and zones are kept
unless target redaction was requested. Review the contents before sharing.
"#;

fn log_manager() -> AppResult<&'static std::sync::Arc<LogManager>> {
    get_log_manager().ok_or_else(|| AppError::Config("Log manager not initialized".to_string()))
}

/// Get recent logs from the ring buffer
pub async fn get_recent_logs(max_lines: Option<u32>, filter: Option<LogFilter>) -> AppResult<Vec<LogLine>> {
    let lines = max_lines.unwrap_or(1000).min(MAX_BUNDLE_LINES);
    Ok(log_manager()?.get_recent_logs(lines, filter))
}

/// Clear the in-memory log view (does not delete file logs)
pub async fn clear_log_view() -> AppResult<()> {
    log_manager()?.clear_view();
    Ok(())
}

/// Get the logs directory path
pub async fn get_logs_dir() -> AppResult<String> {
    Ok(log_manager()?.logs_dir().to_string_lossy().to_string())
}

/// Export a debug bundle as a zip file
pub async fn export_debug_bundle(
    state: &AppState,
    path: String,
    options: Option<DebugBundleOptions>,
) -> AppResult<String> {
    let options = options.unwrap_or_default();
    let manager = log_manager()?;
    let export_path = validate_bundle_path(&path)?;

    let settings = state.settings.read().clone();
    let tunnels = state.tunnels.list(None);

    let manager = manager.clone();
    let target = export_path.clone();
    let written = tokio::task::spawn_blocking(move || {
        write_debug_bundle(&target, &manager, &settings, &tunnels, &options)
    })
    .await??;

    tracing::info!("Debug bundle exported to: {}", export_path.display());
    super::log(
        LogLevel::Info,
        LogSubsystem::App,
        format!("Debug bundle exported with {} log entries", written),
    );

    Ok(export_path.to_string_lossy().to_string())
}

/// Write the bundle. Returns the number of log lines included.
pub fn write_debug_bundle(
    path: &Path,
    manager: &LogManager,
    settings: &AppSettings,
    tunnels: &[TunnelEntry],
    options: &DebugBundleOptions,
) -> AppResult<usize> {
    let max_lines = options.max_lines.unwrap_or(MAX_BUNDLE_LINES).min(MAX_BUNDLE_LINES);
    let logs = manager.get_recent_logs(max_lines, None);
    let redactor = if options.redact_targets.unwrap_or(false) {
        let redactor = TargetRedactor::collect(tunnels, &logs);
        tracing::debug!(identifiers = redactor.len(), "Redacting targets from debug bundle");
        Some(redactor)
    } else {
        None
    };
    let redact = |value: serde_json::Value| match &redactor {
        Some(redactor) => redactor.redact_json(&value),
        None => value,
    };

    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let zip_options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    zip.start_file("logs.jsonl", zip_options)?;
    let mut total_size: u64 = 0;
    let mut written = 0;
    for log in &logs {
        let mut line = serde_json::to_string(&redact(serde_json::to_value(log)?))?;
        line.push('\n');
        total_size += line.len() as u64;
        if total_size > MAX_BUNDLE_SIZE {
            tracing::warn!(written, "Debug bundle size limit reached, truncating logs");
            break;
        }
        zip.write_all(line.as_bytes())?;
        written += 1;
    }

    zip.start_file("app_info.json", zip_options)?;
    zip.write_all(serde_json::to_string_pretty(&AppInfo::collect())?.as_bytes())?;

    if options.include_config.unwrap_or(true) {
        zip.start_file("config_snapshot.json", zip_options)?;
        let snapshot = sanitize_json(&serde_json::to_value(settings)?);
        zip.write_all(serde_json::to_string_pretty(&snapshot)?.as_bytes())?;
    }

    if options.include_tunnels.unwrap_or(true) {
        zip.start_file("tunnels.json", zip_options)?;
        let snapshot = redact(serde_json::json!({
            "tunnels": serde_json::to_value(tunnels)?,
            "tunnel_count": tunnels.len(),
        }));
        zip.write_all(serde_json::to_string_pretty(&snapshot)?.as_bytes())?;
    }

    zip.start_file("README.txt", zip_options)?;
    zip.write_all(README.as_bytes())?;

    zip.finish()?;
    Ok(written)
}

/// Validate the bundle export path
fn validate_bundle_path(path: &str) -> AppResult<PathBuf> {
    let path = Path::new(path);

    if path.extension().and_then(|e| e.to_str()) != Some("zip") {
        return Err(AppError::InvalidConfig("Bundle path must end with .zip".to_string()));
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.exists() {
        return Err(AppError::InvalidConfig("Parent directory does not exist".to_string()));
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::InvalidConfig("Invalid filename".to_string()))?;
    let canonical = parent.canonicalize()?.join(file_name);

    let lowered = canonical.to_string_lossy().to_lowercase();
    let forbidden = FORBIDDEN_PREFIXES.iter().any(|prefix| canonical.starts_with(prefix))
        || lowered.contains("\\windows\\system32")
        || lowered.contains("\\program files");
    if forbidden {
        return Err(AppError::PathTraversalRejected(
            "Cannot write the debug bundle to a system directory".to_string(),
        ));
    }

    Ok(canonical)
}
