//! Line-delimited JSON command bridge for an out-of-process UI.
//!
//! Each input line is `{"id": .., "cmd": "..", "args": {..}}`. Each request is
//! answered with `{"id": .., "ok": ..}` or `{"id": .., "error": {code, message, details}}`.
//! Tunnel transitions and health notifications are pushed unprompted as
//! `{"event": "..", "data": ..}`. Requests run concurrently; responses may
//! arrive out of order.

use crate::error::{AppError, AppResult, SerializableError};
use crate::logging::{self, DebugBundleOptions, LogFilter};
use crate::notify::TunnelNotification;
use crate::sftp::commands::{self as sftp, SftpTarget};
use crate::state::AppState;
use crate::tunnel::commands as tunnel;
use crate::tunnel::TunnelRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    cmd: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
enum Command {
    TunnelConnect(TunnelRequest),
    TunnelDisconnect {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    TunnelList {
        #[serde(default)]
        target_prefix: Option<String>,
    },
    TunnelGet {
        key: String,
    },
    TunnelStatus {
        key: String,
    },
    TunnelHealthCheck {},
    SftpList {
        target: SftpTarget,
        #[serde(default)]
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpDownload {
        target: SftpTarget,
        remote_path: String,
        local_path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpUpload {
        target: SftpTarget,
        local_path: String,
        #[serde(default)]
        remote_dir: String,
    },
    SftpMkdir {
        target: SftpTarget,
        #[serde(default)]
        parent: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpDelete {
        target: SftpTarget,
        path: String,
        #[serde(default)]
        is_directory: bool,
    },
    SftpCurrentUsername {},
    #[serde(rename_all = "camelCase")]
    GetRecentLogs {
        #[serde(default)]
        max_lines: Option<u32>,
        #[serde(default)]
        filter: Option<LogFilter>,
    },
    ClearLogView {},
    GetLogsDir {},
    ExportDebugBundle {
        path: String,
        #[serde(default)]
        options: Option<DebugBundleOptions>,
    },
    GetSettings {},
    Shutdown {},
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Reply { id: Value, ok: Value },
    Failure { id: Value, error: SerializableError },
    Event { event: &'static str, data: Value },
}

fn to_value<T: Serialize>(value: AppResult<T>) -> AppResult<Value> {
    value.and_then(|v| serde_json::to_value(v).map_err(AppError::from))
}

async fn dispatch(state: &AppState, command: Command) -> AppResult<Value> {
    match command {
        Command::TunnelConnect(request) => to_value(tunnel::tunnel_connect(state, request).await),
        Command::TunnelDisconnect { key } => to_value(tunnel::tunnel_disconnect(state, key).await),
        Command::TunnelList { target_prefix } => to_value(tunnel::tunnel_list(state, target_prefix).await),
        Command::TunnelGet { key } => to_value(tunnel::tunnel_get(state, key).await),
        Command::TunnelStatus { key } => to_value(tunnel::tunnel_status(state, key).await),
        Command::TunnelHealthCheck {} => to_value(tunnel::tunnel_health_check(state).await),
        Command::SftpList { target, path } => to_value(sftp::sftp_list(state, target, path).await),
        Command::SftpDownload {
            target,
            remote_path,
            local_path,
        } => to_value(sftp::sftp_download(state, target, remote_path, local_path).await),
        Command::SftpUpload {
            target,
            local_path,
            remote_dir,
        } => to_value(sftp::sftp_upload(state, target, local_path, remote_dir).await),
        Command::SftpMkdir { target, parent, name } => to_value(sftp::sftp_mkdir(state, target, parent, name).await),
        Command::SftpDelete {
            target,
            path,
            is_directory,
        } => to_value(sftp::sftp_delete(state, target, path, is_directory).await),
        Command::SftpCurrentUsername {} => to_value(sftp::sftp_current_username().await),
        Command::GetRecentLogs { max_lines, filter } => {
            to_value(logging::commands::get_recent_logs(max_lines, filter).await)
        }
        Command::ClearLogView {} => to_value(logging::commands::clear_log_view().await),
        Command::GetLogsDir {} => to_value(logging::commands::get_logs_dir().await),
        Command::ExportDebugBundle { path, options } => {
            to_value(logging::commands::export_debug_bundle(state, path, options).await)
        }
        Command::GetSettings {} => {
            let settings = state.settings.read().clone();
            to_value(Ok(settings))
        }
        // Handled by the read loop
        Command::Shutdown {} => Ok(Value::Null),
    }
}

fn parse(line: &str) -> Result<(Value, Command), (Value, AppError)> {
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| (Value::Null, AppError::Serialization(format!("Malformed request: {}", e))))?;

    let args = if envelope.args.is_null() {
        Value::Object(Default::default())
    } else {
        envelope.args
    };
    let tagged = serde_json::json!({ "cmd": envelope.cmd, "args": args });
    match serde_json::from_value::<Command>(tagged) {
        Ok(command) => Ok((envelope.id, command)),
        Err(e) => Err((
            envelope.id,
            AppError::Serialization(format!("Invalid command '{}': {}", envelope.cmd, e)),
        )),
    }
}

fn reply(id: Value, result: AppResult<Value>) -> Outbound {
    match result {
        Ok(ok) => Outbound::Reply { id, ok },
        Err(e) => Outbound::Failure {
            id,
            error: SerializableError::from(&e),
        },
    }
}

fn event<T: Serialize>(name: &'static str, data: &T) -> Outbound {
    Outbound::Event {
        event: name,
        data: serde_json::to_value(data).unwrap_or(Value::Null),
    }
}

/// Serve requests from `input` until EOF or a `shutdown` command.
///
/// In-flight requests are allowed to finish before this returns; shutting the
/// application state down is left to the caller.
pub async fn run<R, W>(
    state: Arc<AppState>,
    input: R,
    output: W,
    notifications: Option<mpsc::UnboundedReceiver<TunnelNotification>>,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(message) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode bridge message: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                tracing::warn!("Bridge output closed: {}", e);
                break;
            }
            let _ = output.flush().await;
        }
    });

    // Forwarders drain whatever is already queued once told to stop
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut forwarders = JoinSet::new();
    {
        let mut events = state.registry.subscribe();
        let mut stop = stop_rx.clone();
        let tx = out_tx.clone();
        forwarders.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(e) => {
                            if tx.send(event("tunnel_state", &e)).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Bridge dropped tunnel events"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = stop.changed() => {
                        while let Ok(e) = events.try_recv() {
                            let _ = tx.send(event("tunnel_state", &e));
                        }
                        break;
                    }
                }
            }
        });
    }
    if let Some(mut notifications) = notifications {
        let mut stop = stop_rx.clone();
        let tx = out_tx.clone();
        forwarders.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = notifications.recv() => match received {
                        Some(notification) => {
                            if tx.send(event("tunnel_lost", &notification)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = stop.changed() => {
                        while let Ok(notification) = notifications.try_recv() {
                            let _ = tx.send(event("tunnel_lost", &notification));
                        }
                        break;
                    }
                }
            }
        });
    }

    let mut requests = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Bridge input error: {}", e);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (id, command) = match parse(trimmed) {
            Ok(parsed) => parsed,
            Err((id, e)) => {
                tracing::debug!("Rejected bridge request: {}", e);
                let _ = out_tx.send(reply(id, Err(e)));
                continue;
            }
        };

        if matches!(command, Command::Shutdown {}) {
            tracing::info!("Shutdown requested over bridge");
            let _ = out_tx.send(reply(id, Ok(Value::Null)));
            break;
        }

        let state = state.clone();
        let tx = out_tx.clone();
        requests.spawn(async move {
            let result = dispatch(&state, command).await;
            let _ = tx.send(reply(id, result));
        });
    }

    while let Some(joined) = requests.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Bridge request task failed: {}", e);
        }
    }
    let _ = stop_tx.send(true);
    while forwarders.join_next().await.is_some() {}
    drop(out_tx);
    writer.await?;
    Ok(())
}
