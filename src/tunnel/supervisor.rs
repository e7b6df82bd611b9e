//! Owns the external tunneling helper processes.
//!
//! Every invocation is built as an argument vector from re-validated
//! identifiers; no shell is involved. A spawn only succeeds once the forwarded
//! local port actually accepts connections.

use super::key::TunnelKey;
use crate::config::TunnelSettings;
use crate::error::{AppError, AppResult};
use crate::validation;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How often the helper is polled while waiting for it to listen
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-attempt timeout of the local connect check
const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period for a killed helper to be reaped
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines of helper output kept for error reports
const OUTPUT_TAIL_LINES: usize = 20;

/// `gcloud compute start-iap-tunnel` announces e.g. "Listening on port [41237]."
static LISTENING_PORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)listening on port \[?(\d{1,5})\]?").unwrap());

/// Opaque reference to a supervised process. The handle itself never leaves the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the UI asks for when opening a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub target: String,
    pub remote_port: u16,
    pub project: String,
    pub zone: String,
    /// Fixed local port; `None` lets the OS pick one
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl TunnelRequest {
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.target.clone(), self.remote_port)
    }

    pub fn validate(&self) -> AppResult<()> {
        validation::validate_instance_name(&self.target)?;
        validation::validate_remote_port(self.remote_port)?;
        validation::validate_project_id(&self.project)?;
        validation::validate_zone(&self.zone)?;
        Ok(())
    }
}

/// Builds the helper invocation for a request
pub trait TunnelLauncher: Send + Sync {
    /// `local_port` is 0 when the helper should bind an ephemeral port.
    fn command(&self, request: &TunnelRequest, local_port: u16) -> Command;
}

/// Launches `gcloud compute start-iap-tunnel`
pub struct IapTunnelLauncher {
    program: String,
    bind_host: String,
}

impl IapTunnelLauncher {
    pub fn new(settings: &TunnelSettings) -> Self {
        Self {
            program: settings.helper_program.clone(),
            bind_host: settings.bind_host.clone(),
        }
    }
}

impl TunnelLauncher for IapTunnelLauncher {
    fn command(&self, request: &TunnelRequest, local_port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("compute")
            .arg("start-iap-tunnel")
            .arg(&request.target)
            .arg(request.remote_port.to_string())
            .arg(format!("--local-host-port={}:{}", self.bind_host, local_port))
            .arg("--zone")
            .arg(&request.zone)
            .arg("--project")
            .arg(&request.project);
        cmd
    }
}

/// Result of a successful spawn
#[derive(Debug, Clone, Copy)]
pub struct SpawnedTunnel {
    pub process: ProcessId,
    pub local_port: u16,
}

/// Liveness of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(String),
    /// The supervisor doesn't own a process with this id
    Unknown,
    CheckFailed(String),
}

struct ManagedProcess {
    key: TunnelKey,
    child: Child,
}

/// Spawns, owns and reaps tunnel helper processes
pub struct TunnelSupervisor {
    launcher: Arc<dyn TunnelLauncher>,
    local_host: String,
    spawn_timeout: Duration,
    processes: Mutex<HashMap<ProcessId, ManagedProcess>>,
}

impl TunnelSupervisor {
    pub fn new(launcher: Arc<dyn TunnelLauncher>, settings: &TunnelSettings) -> Self {
        Self {
            launcher,
            local_host: settings.bind_host.clone(),
            spawn_timeout: settings.spawn_timeout(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Host the helper binds, used for local connect checks
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Spawn a helper for `request` and wait until its local port is live
    pub async fn spawn(&self, request: &TunnelRequest) -> AppResult<SpawnedTunnel> {
        request.validate()?;

        let key = request.key();
        let requested_port = request.local_port.unwrap_or(0);

        let mut child = {
            let mut command = self.launcher.command(request, requested_port);
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            command.spawn().map_err(|e| AppError::Spawn(e.to_string()))?
        };

        let pid = child.id();
        tracing::info!(key = %key, pid = ?pid, "Spawned tunnel helper");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_output(key.clone(), stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(key.clone(), stderr, line_tx);
        }

        let confirmation = tokio::time::timeout(
            self.spawn_timeout,
            self.await_listening(&mut child, &mut line_rx, requested_port),
        )
        .await;

        let local_port = match confirmation {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                tracing::warn!(key = %key, "Tunnel helper failed to start: {}", e);
                reap(&key, &mut child).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(key = %key, timeout = ?self.spawn_timeout, "Tunnel helper never started listening");
                reap(&key, &mut child).await;
                return Err(AppError::PortConfirmationTimeout(self.spawn_timeout));
            }
        };

        let process = ProcessId::new();
        self.processes.lock().insert(
            process,
            ManagedProcess {
                key: key.clone(),
                child,
            },
        );

        tracing::info!(key = %key, local_port, process = %process, "Tunnel listening");
        Ok(SpawnedTunnel { process, local_port })
    }

    /// Poll the helper until it announces its port and that port accepts connections.
    ///
    /// A fixed `requested_port` may already be held by another process, so the
    /// helper's own announcement is required before the connect check counts.
    async fn await_listening(
        &self,
        child: &mut Child,
        lines: &mut mpsc::UnboundedReceiver<String>,
        requested_port: u16,
    ) -> AppResult<u16> {
        let mut port = None;
        let mut recent: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);

        loop {
            while let Ok(line) = lines.try_recv() {
                if port.is_none() {
                    port = parse_listening_port(&line);
                    if let Some(announced) = port.filter(|p| requested_port != 0 && *p != requested_port) {
                        tracing::warn!(requested_port, announced, "Helper listens on a different port than requested");
                    }
                }
                push_tail(&mut recent, line);
            }

            if let Some(status) = child.try_wait()? {
                // Collect whatever the helper printed on its way out
                let _ = tokio::time::timeout(Duration::from_millis(200), async {
                    while let Some(line) = lines.recv().await {
                        push_tail(&mut recent, line);
                    }
                })
                .await;
                let output: Vec<String> = recent.into_iter().collect();
                return Err(AppError::HelperExited(format!("{}: {}", status, output.join("\n"))));
            }

            if let Some(port) = port {
                if check_local_port(&self.local_host, port, CONNECT_CHECK_TIMEOUT).await.is_ok() {
                    return Ok(port);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Liveness of an owned process
    pub fn status(&self, process: &ProcessId) -> ProcessStatus {
        let mut processes = self.processes.lock();
        match processes.get_mut(process) {
            None => ProcessStatus::Unknown,
            Some(managed) => match managed.child.try_wait() {
                Ok(None) => ProcessStatus::Running,
                Ok(Some(status)) => ProcessStatus::Exited(status.to_string()),
                Err(e) => ProcessStatus::CheckFailed(e.to_string()),
            },
        }
    }

    /// OS pid of an owned process
    pub fn pid(&self, process: &ProcessId) -> Option<u32> {
        self.processes.lock().get(process).and_then(|m| m.child.id())
    }

    pub fn owned_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Terminate and reap an owned process. Unknown or already dead processes are fine.
    pub async fn kill(&self, process: &ProcessId) -> AppResult<()> {
        let managed = self.processes.lock().remove(process);
        if let Some(mut managed) = managed {
            tracing::info!(key = %managed.key, process = %process, "Stopping tunnel helper");
            reap(&managed.key, &mut managed.child).await;
        }
        Ok(())
    }

    /// Terminate every owned process. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<ManagedProcess> = self.processes.lock().drain().map(|(_, m)| m).collect();
        let count = drained.len();
        for mut managed in drained {
            reap(&managed.key, &mut managed.child).await;
        }
        if count > 0 {
            tracing::info!(count, "Supervisor stopped all tunnel helpers");
        }
        count
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        for (_, managed) in self.processes.get_mut().iter_mut() {
            let _ = managed.child.start_kill();
        }
    }
}

fn push_tail(recent: &mut VecDeque<String>, line: String) {
    if recent.len() == OUTPUT_TAIL_LINES {
        recent.pop_front();
    }
    recent.push_back(line);
}

/// Drain a helper pipe for the lifetime of the process so it never blocks on a full pipe
fn forward_output<R>(key: TunnelKey, reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(key = %key, "helper: {}", line);
            // Receiver is gone once the port is confirmed
            let _ = tx.send(line);
        }
    });
}

async fn reap(key: &TunnelKey, child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(key = %key, %status, "Tunnel helper already exited");
        return;
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(key = %key, "Kill signal not delivered: {}", e);
    }

    match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(key = %key, %status, "Tunnel helper reaped"),
        Ok(Err(e)) => tracing::warn!(key = %key, "Failed to reap tunnel helper: {}", e),
        Err(_) => tracing::warn!(key = %key, "Tunnel helper did not exit after kill"),
    }
}

/// Extract the bound port from a line of helper output
pub fn parse_listening_port(line: &str) -> Option<u16> {
    LISTENING_PORT_REGEX
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

/// Check that something accepts TCP connections on `host:port`
pub async fn check_local_port(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {:?}", timeout)),
    }
}
