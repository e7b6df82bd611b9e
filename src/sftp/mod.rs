//! SFTP over an established tunnel.
//!
//! Connections are opened per operation against the tunnel's local port and
//! run on blocking threads so a stalled remote peer never holds up the async
//! runtime.

pub mod commands;
pub mod transfer;

pub use transfer::{copy_with_limit, RemoteFileEntry, RemoteFs, RemoteStat, SecureFileTransfer, UploadOutcome};

use crate::config::TransferSettings;
use crate::error::{AppError, AppResult};
use sha2::{Digest, Sha256};
use ssh2::{Session as Ssh2Session, Sftp};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Authentication steps, split out so the fallback order can be tested without a server
pub trait AuthBackend {
    fn agent_auth(&self, username: &str) -> Result<(), String>;
    fn key_file_auth(&self, username: &str, key_path: &Path) -> Result<(), String>;
    fn is_authenticated(&self) -> bool;
}

impl AuthBackend for Ssh2Session {
    fn agent_auth(&self, username: &str) -> Result<(), String> {
        self.userauth_agent(username).map_err(|e| e.to_string())
    }

    fn key_file_auth(&self, username: &str, key_path: &Path) -> Result<(), String> {
        self.userauth_pubkey_file(username, None, key_path, None)
            .map_err(|e| e.to_string())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated()
    }
}

/// Try the SSH agent, then each identity file in order.
///
/// On total failure every attempt's reason is reported, not just the last one.
pub fn authenticate<A: AuthBackend + ?Sized>(
    backend: &A,
    username: &str,
    identity_files: &[PathBuf],
) -> AppResult<()> {
    let mut attempts = Vec::new();

    match backend.agent_auth(username) {
        Ok(()) if backend.is_authenticated() => return Ok(()),
        Ok(()) => attempts.push("ssh-agent: accepted but session not authenticated".to_string()),
        Err(e) => {
            tracing::warn!("SSH agent authentication failed: {}", e);
            attempts.push(format!("ssh-agent: {}", e));
        }
    }

    for key_path in identity_files {
        if !key_path.exists() {
            attempts.push(format!("key file {}: not found", key_path.display()));
            continue;
        }
        match backend.key_file_auth(username, key_path) {
            Ok(()) if backend.is_authenticated() => return Ok(()),
            Ok(()) => attempts.push(format!(
                "key file {}: accepted but session not authenticated",
                key_path.display()
            )),
            Err(e) => {
                tracing::warn!(key = %key_path.display(), "Key file authentication failed: {}", e);
                attempts.push(format!("key file {}: {}", key_path.display(), e));
            }
        }
    }

    Err(AppError::AuthenticationFailed(attempts))
}

/// Compute SHA256 fingerprint of a host key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// An authenticated SFTP session
pub struct SftpConnection {
    sftp: Sftp,
    #[allow(dead_code)]
    session: Ssh2Session,
    #[allow(dead_code)]
    tcp: TcpStream,
}

impl SftpConnection {
    /// Connect to `host:port` (a tunnel's local end) and open the SFTP subsystem
    pub fn connect(host: &str, port: u16, username: &str, settings: &TransferSettings) -> AppResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AppError::RemoteIo(format!("Could not resolve {}:{}", host, port)))?;

        let tcp = TcpStream::connect_timeout(&addr, settings.connect_timeout())
            .map_err(|e| AppError::RemoteIo(format!("Failed to connect to {}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(settings.io_timeout()))?;
        tcp.set_write_timeout(Some(settings.io_timeout()))?;

        let mut session = Ssh2Session::new()
            .map_err(|e| AppError::RemoteIo(format!("Failed to create session: {}", e)))?;
        session.set_tcp_stream(tcp.try_clone()?);
        session.set_timeout(settings.io_timeout().as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| AppError::RemoteIo(format!("SSH handshake failed: {}", e)))?;

        let fingerprint = session
            .host_key()
            .map(|(key, _)| compute_sha256_fingerprint(key));
        tracing::info!(port, username, fingerprint = ?fingerprint, "SSH handshake complete");

        authenticate(&session, username, &settings.identity_paths())?;

        let sftp = session
            .sftp()
            .map_err(|e| AppError::RemoteIo(format!("Failed to open SFTP: {}", e)))?;

        Ok(Self { sftp, session, tcp })
    }
}

impl RemoteFs for SftpConnection {
    type Reader = ssh2::File;
    type Writer = ssh2::File;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, RemoteStat)>> {
        let entries = self.sftp.readdir(path)?;
        Ok(entries
            .into_iter()
            .map(|(entry_path, stat)| {
                let remote = RemoteStat {
                    size: stat.size.unwrap_or(0),
                    is_dir: stat.is_dir(),
                    modified: stat.mtime.map(|t| t as i64),
                };
                (entry_path, remote)
            })
            .collect())
    }

    fn open_read(&self, path: &Path) -> io::Result<ssh2::File> {
        Ok(self.sftp.open(path)?)
    }

    fn create(&self, path: &Path) -> io::Result<ssh2::File> {
        Ok(self.sftp.create(path)?)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        Ok(self.sftp.mkdir(path, 0o755)?)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        Ok(self.sftp.unlink(path)?)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        Ok(self.sftp.rmdir(path)?)
    }
}

/// Username of the local user, used when a caller doesn't name one
pub fn current_username() -> AppResult<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| AppError::Config("Could not determine current username".to_string()))
}
