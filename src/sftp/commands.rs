//! SFTP entry points invoked by the UI.
//!
//! Paths and names are checked here before a tunnel port is looked up or any
//! connection is made; the blocking SFTP work then runs off the async runtime.

use super::{current_username, RemoteFileEntry, SecureFileTransfer, SftpConnection, UploadOutcome};
use crate::error::AppResult;
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::state::AppState;
use crate::tunnel::TunnelKey;
use crate::validation;
use serde::Deserialize;

/// Which tunnel to go through, and as whom
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpTarget {
    /// Wire-encoded tunnel key, `"{target}:{port}"`
    pub tunnel: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl SftpTarget {
    fn resolve(&self) -> AppResult<(TunnelKey, String)> {
        let key: TunnelKey = self.tunnel.parse()?;
        let username = match &self.username {
            Some(username) => username.clone(),
            None => current_username()?,
        };
        validation::validate_username(&username)?;
        Ok((key, username))
    }
}

async fn run_transfer<T, F>(state: &AppState, key: TunnelKey, username: String, op: F) -> AppResult<T>
where
    F: FnOnce(SecureFileTransfer<SftpConnection>) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let port = state.tunnels.connected_port(&key)?;
    let host = state.tunnels.supervisor().local_host().to_string();
    let settings = state.settings.read().transfer.clone();

    let result = tokio::task::spawn_blocking(move || {
        let connection = SftpConnection::connect(&host, port, &username, &settings)?;
        let transfer = SecureFileTransfer::new(connection, &username)?
            .with_transfer_limit(settings.max_transfer_bytes)
            .with_chunk_size(settings.chunk_size);
        op(transfer)
    })
    .await?;

    if let Err(e) = &result {
        logging::log_tunnel(
            LogLevel::Warn,
            LogSubsystem::Sftp,
            key.to_string(),
            format!("SFTP operation failed: {}", e),
        );
    }
    result
}

pub async fn sftp_list(state: &AppState, target: SftpTarget, path: String) -> AppResult<Vec<RemoteFileEntry>> {
    let (key, username) = target.resolve()?;
    validation::validate_remote_path(&path, &username)?;

    run_transfer(state, key, username, move |t| t.list_directory(&path)).await
}

pub async fn sftp_download(
    state: &AppState,
    target: SftpTarget,
    remote_path: String,
    local_path: String,
) -> AppResult<u64> {
    let (key, username) = target.resolve()?;
    validation::validate_remote_path(&remote_path, &username)?;

    run_transfer(state, key, username, move |t| t.download(&remote_path, &local_path)).await
}

pub async fn sftp_upload(
    state: &AppState,
    target: SftpTarget,
    local_path: String,
    remote_dir: String,
) -> AppResult<UploadOutcome> {
    let (key, username) = target.resolve()?;
    validation::validate_remote_path(&remote_dir, &username)?;

    run_transfer(state, key, username, move |t| t.upload(&local_path, &remote_dir)).await
}

pub async fn sftp_mkdir(state: &AppState, target: SftpTarget, parent: String, name: String) -> AppResult<String> {
    let (key, username) = target.resolve()?;
    validation::validate_name(&name)?;
    validation::validate_remote_path(&parent, &username)?;

    run_transfer(state, key, username, move |t| t.create_directory(&parent, &name)).await
}

pub async fn sftp_delete(
    state: &AppState,
    target: SftpTarget,
    path: String,
    is_directory: bool,
) -> AppResult<()> {
    let (key, username) = target.resolve()?;
    validation::validate_remote_path(&path, &username)?;

    run_transfer(state, key, username, move |t| t.delete(&path, is_directory)).await
}

/// Local username used when a request omits one
pub async fn sftp_current_username() -> AppResult<String> {
    current_username()
}
