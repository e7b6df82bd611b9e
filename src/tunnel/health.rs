//! Periodic liveness checks over Connected tunnels.
//!
//! A tunnel is healthy only when its helper process is still running and its
//! local port still accepts connections. Failures move the entry to Error and
//! notify; nothing is reconnected automatically.

use super::registry::{TunnelEntry, TunnelRegistry};
use super::supervisor::{check_local_port, ProcessStatus, TunnelSupervisor};
use crate::config::HealthSettings;
use crate::notify::{NotificationSink, TunnelNotification};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    ProcessExited(String),
    ProcessMissing,
    PortClosed(String),
    CheckFailed(String),
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFailure::ProcessExited(status) => write!(f, "Tunnel process exited ({})", status),
            HealthFailure::ProcessMissing => write!(f, "Tunnel process is no longer supervised"),
            HealthFailure::PortClosed(err) => write!(f, "Local port closed: {}", err),
            HealthFailure::CheckFailed(err) => write!(f, "Health check failed: {}", err),
        }
    }
}

/// Outcome counts of one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub discarded: usize,
}

pub struct HealthMonitor {
    registry: Arc<TunnelRegistry>,
    supervisor: Arc<TunnelSupervisor>,
    notifier: Arc<dyn NotificationSink>,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        supervisor: Arc<TunnelSupervisor>,
        notifier: Arc<dyn NotificationSink>,
        settings: &HealthSettings,
    ) -> Self {
        Self {
            registry,
            supervisor,
            notifier,
            interval: settings.interval(),
            check_timeout: settings.check_timeout(),
        }
    }

    /// Check every Connected tunnel once
    pub async fn run_once(&self) -> HealthReport {
        let snapshot = self.registry.connected();
        let mut report = HealthReport {
            checked: snapshot.len(),
            ..HealthReport::default()
        };

        let checks = snapshot.iter().map(|entry| async move {
            let outcome = match tokio::time::timeout(self.check_timeout, self.check(entry)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HealthFailure::CheckFailed(format!(
                    "timed out after {:?}",
                    self.check_timeout
                ))),
            };
            (entry, outcome)
        });

        for (entry, outcome) in futures::future::join_all(checks).await {
            match outcome {
                Ok(()) => {
                    self.registry.record_health_check(&entry.key, entry.generation);
                    report.healthy += 1;
                }
                Err(failure) => {
                    let cause = failure.to_string();
                    match self.registry.mark_unhealthy(&entry.key, entry.generation, cause.clone()) {
                        Some(updated) => {
                            tracing::warn!(key = %entry.key, "Health check failed: {}", cause);
                            self.notifier.notify(TunnelNotification::from_entry(&updated, cause));
                            report.failed += 1;
                        }
                        None => {
                            tracing::debug!(key = %entry.key, "Health result discarded, tunnel changed mid-check");
                            report.discarded += 1;
                        }
                    }
                }
            }
        }

        if report.checked > 0 {
            tracing::debug!(?report, "Health pass complete");
        }
        report
    }

    async fn check(&self, entry: &TunnelEntry) -> Result<(), HealthFailure> {
        let process = entry.process.ok_or(HealthFailure::ProcessMissing)?;
        match self.supervisor.status(&process) {
            ProcessStatus::Running => {}
            ProcessStatus::Exited(status) => return Err(HealthFailure::ProcessExited(status)),
            ProcessStatus::Unknown => return Err(HealthFailure::ProcessMissing),
            ProcessStatus::CheckFailed(e) => return Err(HealthFailure::CheckFailed(e)),
        }

        let port = entry
            .local_port
            .ok_or_else(|| HealthFailure::CheckFailed("connected tunnel has no local port".into()))?;
        check_local_port(self.supervisor.local_host(), port, self.check_timeout)
            .await
            .map_err(HealthFailure::PortClosed)
    }

    /// Run passes on the configured interval until the handle is stopped
    pub fn start(self: Arc<Self>) -> HealthMonitorHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let monitor = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            tracing::info!(interval = ?monitor.interval, "Health monitor started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        monitor.run_once().await;
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        });

        HealthMonitorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

pub struct HealthMonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("Health monitor task ended abnormally: {}", e);
        }
    }
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use crate::tunnel::registry::{ConnectTicket, TunnelStatus};
    use crate::tunnel::supervisor::tests::{request, test_settings, ScriptLauncher};
    use std::net::TcpListener;

    struct Fixture {
        registry: Arc<TunnelRegistry>,
        supervisor: Arc<TunnelSupervisor>,
        monitor: HealthMonitor,
        notifications: tokio::sync::mpsc::UnboundedReceiver<TunnelNotification>,
    }

    fn fixture(port: u16) -> Fixture {
        let registry = Arc::new(TunnelRegistry::new());
        let supervisor = Arc::new(TunnelSupervisor::new(
            ScriptLauncher::announcing(port),
            &test_settings(5),
        ));
        let (notifier, notifications) = ChannelNotifier::new();
        let settings = HealthSettings {
            interval_secs: 1,
            check_timeout_secs: 2,
        };
        let monitor = HealthMonitor::new(registry.clone(), supervisor.clone(), Arc::new(notifier), &settings);
        Fixture {
            registry,
            supervisor,
            monitor,
            notifications,
        }
    }

    async fn connect(fx: &Fixture, target: &str) -> TunnelEntry {
        let req = request(target, 22);
        let key = req.key();
        let generation = match fx.registry.begin_connect(&key, &req.project, &req.zone) {
            ConnectTicket::Fresh { generation, .. } => generation,
            other => panic!("expected fresh ticket, got {:?}", other),
        };
        let spawned = fx.supervisor.spawn(&req).await.unwrap();
        assert!(fx
            .registry
            .mark_connected(&key, generation, spawned.local_port, spawned.process));
        fx.registry.get(&key).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_tunnel_stays_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let entry = connect(&fx, "vm-a").await;

        let report = fx.monitor.run_once().await;
        assert_eq!(report.healthy, 1);
        assert_eq!(fx.registry.status(&entry.key), TunnelStatus::Connected);
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_killed_process_moves_to_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut fx = fixture(listener.local_addr().unwrap().port());
        let entry = connect(&fx, "vm-a").await;

        let pid = fx.supervisor.pid(&entry.process.unwrap()).unwrap();
        let status = std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = fx.monitor.run_once().await;
        assert_eq!(report.failed, 1);

        let updated = fx.registry.get(&entry.key).unwrap();
        assert_eq!(updated.status, TunnelStatus::Error);
        assert!(updated.error.unwrap().contains("process"));

        let notification = fx.notifications.try_recv().unwrap();
        assert_eq!(notification.target, "vm-a");
        assert_eq!(notification.remote_port, 22);
        assert!(notification.cause.contains("process"));
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_port_moves_to_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut fx = fixture(listener.local_addr().unwrap().port());
        let entry = connect(&fx, "vm-a").await;
        drop(listener);

        fx.monitor.run_once().await;
        let updated = fx.registry.get(&entry.key).unwrap();
        assert_eq!(updated.status, TunnelStatus::Error);
        assert!(updated.error.unwrap().starts_with("Local port closed"));
        assert!(fx.notifications.try_recv().is_ok());
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_tunnel_is_not_resurrected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut fx = fixture(listener.local_addr().unwrap().port());
        let entry = connect(&fx, "vm-a").await;
        drop(listener);

        let snapshot = fx.registry.connected();
        fx.registry.remove(&entry.key);
        // Result computed against the stale snapshot
        assert!(fx
            .registry
            .mark_unhealthy(&snapshot[0].key, snapshot[0].generation, "port closed")
            .is_none());

        let report = fx.monitor.run_once().await;
        assert_eq!(report.checked, 0);
        assert!(fx.registry.get(&entry.key).is_none());
        assert!(fx.notifications.try_recv().is_err());
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_task_detects_failure_within_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let entry = connect(&fx, "vm-a").await;
        fx.supervisor.kill(&entry.process.unwrap()).await.unwrap();

        let Fixture {
            registry,
            supervisor,
            monitor,
            mut notifications,
        } = fx;
        let handle = Arc::new(monitor).start();

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.target, "vm-a");
        assert_eq!(registry.status(&entry.key), TunnelStatus::Error);

        handle.stop().await;
        supervisor.shutdown().await;
    }
}
