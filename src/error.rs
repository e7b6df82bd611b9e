use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid tunnel key: {0}")]
    InvalidTunnelKey(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversalRejected(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Transfer exceeds maximum allowed size of {limit} bytes")]
    TransferSizeExceeded { limit: u64 },

    #[error("Remote I/O error: {0}")]
    RemoteIo(String),

    #[error("Authentication failed after {} attempt(s)", .0.len())]
    AuthenticationFailed(Vec<String>),

    #[error("Failed to spawn tunnel helper: {0}")]
    Spawn(String),

    #[error("Tunnel did not start listening within {0:?}")]
    PortConfirmationTimeout(std::time::Duration),

    #[error("Tunnel helper exited before listening: {0}")]
    HelperExited(String),

    #[error("Tunnel connection failed: {0}")]
    ConnectFailed(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Tunnel not connected: {0}")]
    TunnelNotConnected(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// Validation failures are raised before any process or network resource is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidIdentifier(_)
                | AppError::InvalidTunnelKey(_)
                | AppError::PathTraversalRejected(_)
                | AppError::InvalidName(_)
        )
    }
}

/// Serializable error for the UI boundary
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::InvalidIdentifier(msg) => ("INVALID_IDENTIFIER", msg.clone(), None),
            AppError::InvalidTunnelKey(msg) => ("INVALID_TUNNEL_KEY", msg.clone(), None),
            AppError::PathTraversalRejected(msg) => ("PATH_TRAVERSAL_REJECTED", msg.clone(), None),
            AppError::InvalidName(msg) => ("INVALID_NAME", msg.clone(), None),
            AppError::TransferSizeExceeded { .. } => ("TRANSFER_SIZE_EXCEEDED", err.to_string(), None),
            AppError::RemoteIo(msg) => ("REMOTE_IO_ERROR", msg.clone(), None),
            AppError::AuthenticationFailed(attempts) => (
                "AUTHENTICATION_FAILED",
                "All SSH authentication methods failed".to_string(),
                Some(attempts.join("\n")),
            ),
            AppError::Spawn(msg) => ("SPAWN_ERROR", msg.clone(), None),
            AppError::PortConfirmationTimeout(_) => ("PORT_CONFIRMATION_TIMEOUT", err.to_string(), None),
            AppError::HelperExited(msg) => (
                "HELPER_EXITED",
                "Tunnel helper exited before listening".to_string(),
                Some(msg.clone()),
            ),
            AppError::ConnectFailed(msg) => ("CONNECT_FAILED", msg.clone(), None),
            AppError::TunnelNotFound(key) => ("TUNNEL_NOT_FOUND", format!("Tunnel {} not found", key), None),
            AppError::TunnelNotConnected(key) => (
                "TUNNEL_NOT_CONNECTED",
                format!("Tunnel {} is not connected", key),
                None,
            ),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::InvalidConfig(msg) => ("INVALID_CONFIG", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
            AppError::Unknown(msg) => ("UNKNOWN_ERROR", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<ssh2::Error> for AppError {
    fn from(err: ssh2::Error) -> Self {
        AppError::RemoteIo(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Config(format!("ZIP error: {}", err))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Unknown(format!("Background task failed: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
