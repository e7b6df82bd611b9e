//! Notification sink for tunnels that drop from Connected to Error.

use crate::logging::{self, LogLevel, LogLine, LogSubsystem};
use crate::tunnel::registry::TunnelEntry;
use serde::Serialize;
use tokio::sync::mpsc;

/// Payload handed to the notification collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelNotification {
    pub target: String,
    pub remote_port: u16,
    pub project: String,
    pub zone: String,
    pub cause: String,
    pub timestamp: i64,
}

impl TunnelNotification {
    pub fn from_entry(entry: &TunnelEntry, cause: impl Into<String>) -> Self {
        Self {
            target: entry.key.target().to_string(),
            remote_port: entry.remote_port,
            project: entry.project.clone(),
            zone: entry.zone.clone(),
            cause: cause.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: TunnelNotification);
}

/// Writes notifications to the tracing output and the app log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: TunnelNotification) {
        let key = format!("{}:{}", notification.target, notification.remote_port);
        tracing::warn!(tunnel = %key, cause = %notification.cause, "Tunnel lost");
        if let Some(manager) = logging::get_log_manager() {
            let details = serde_json::to_value(&notification).unwrap_or_default();
            manager.log(
                LogLine::new(
                    LogLevel::Warn,
                    LogSubsystem::Health,
                    format!("Tunnel lost: {}", notification.cause),
                )
                .with_tunnel(key)
                .with_details(details),
            );
        }
    }
}

/// Forwards notifications over a channel, e.g. to the UI bridge
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TunnelNotification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TunnelNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: TunnelNotification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification receiver closed");
        }
    }
}

/// Fans one notification out to several sinks
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutNotifier {
    fn notify(&self, notification: TunnelNotification) {
        for sink in &self.sinks {
            sink.notify(notification.clone());
        }
    }
}
