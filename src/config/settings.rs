use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling for a single transfer (10 GiB)
pub const MAX_TRANSFER_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// External tunneling helper
    #[serde(default = "default_helper_program")]
    pub helper_program: String,
    /// Local interface the helper binds and health checks connect to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Upper bound for the helper to start listening
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_secs: u64,
}

fn default_helper_program() -> String {
    "gcloud".to_string()
}

fn default_bind_host() -> String {
    "localhost".to_string()
}

fn default_spawn_timeout() -> u64 {
    10
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            helper_program: default_helper_program(),
            bind_host: default_bind_host(),
            spawn_timeout_secs: default_spawn_timeout(),
        }
    }
}

impl TunnelSettings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Bound for a single tunnel's check, so one stuck target can't delay the others
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_check_timeout() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            check_timeout_secs: default_check_timeout(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_max_transfer")]
    pub max_transfer_bytes: u64,
    /// Copy buffer size
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Key files tried, in order, after agent authentication fails
    #[serde(default = "default_identity_files")]
    pub identity_files: Vec<String>,
}

fn default_max_transfer() -> u64 {
    MAX_TRANSFER_BYTES
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_io_timeout() -> u64 {
    60
}

fn default_identity_files() -> Vec<String> {
    vec!["~/.ssh/id_rsa".to_string()]
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_transfer_bytes: default_max_transfer(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            identity_files: default_identity_files(),
        }
    }
}

impl TransferSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn identity_paths(&self) -> Vec<PathBuf> {
        self.identity_files
            .iter()
            .map(|p| super::expand_home(p))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "cloud_connector=info,warn".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        let settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<AppSettings>(&content)?
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            settings
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.tunnel.helper_program.trim().is_empty() {
            return Err(AppError::InvalidConfig("tunnel.helper_program cannot be empty".into()));
        }
        if self.tunnel.spawn_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("tunnel.spawn_timeout_secs must be at least 1".into()));
        }
        if self.health.interval_secs == 0 {
            return Err(AppError::InvalidConfig("health.interval_secs must be at least 1".into()));
        }
        if self.health.check_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("health.check_timeout_secs must be at least 1".into()));
        }
        if self.transfer.max_transfer_bytes == 0 {
            return Err(AppError::InvalidConfig("transfer.max_transfer_bytes must be positive".into()));
        }
        if self.transfer.max_transfer_bytes > MAX_TRANSFER_BYTES {
            return Err(AppError::InvalidConfig(format!(
                "transfer.max_transfer_bytes cannot exceed {} bytes",
                MAX_TRANSFER_BYTES
            )));
        }
        if self.transfer.chunk_size == 0 {
            return Err(AppError::InvalidConfig("transfer.chunk_size must be positive".into()));
        }
        Ok(())
    }
}
