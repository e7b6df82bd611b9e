pub mod commands;
pub mod health;
pub mod key;
pub mod registry;
pub mod supervisor;

pub use health::{HealthMonitor, HealthMonitorHandle};
pub use key::TunnelKey;
pub use registry::{ConnectTicket, TunnelEntry, TunnelEvent, TunnelRegistry, TunnelStatus};
pub use supervisor::{TunnelRequest, TunnelSupervisor};

use crate::error::{AppError, AppResult};
use std::sync::Arc;

/// Connect/disconnect orchestration over the registry and supervisor
pub struct TunnelManager {
    registry: Arc<TunnelRegistry>,
    supervisor: Arc<TunnelSupervisor>,
}

impl TunnelManager {
    pub fn new(registry: Arc<TunnelRegistry>, supervisor: Arc<TunnelSupervisor>) -> Self {
        Self { registry, supervisor }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<TunnelSupervisor> {
        &self.supervisor
    }

    /// Open a tunnel, or join the one already open or opening for the same key.
    ///
    /// Returns the local port. Every failure leaves the entry in Error.
    pub async fn connect(&self, request: TunnelRequest) -> AppResult<u16> {
        request.validate()?;
        let key = request.key();

        match self.registry.begin_connect(&key, &request.project, &request.zone) {
            ConnectTicket::Ready(entry) => entry
                .local_port
                .ok_or_else(|| AppError::TunnelNotConnected(key.to_string())),
            ConnectTicket::InFlight(rx) => wait_for_outcome(&key, rx).await,
            ConnectTicket::Fresh {
                generation,
                previous_process,
            } => {
                if let Some(previous) = previous_process {
                    self.supervisor.kill(&previous).await?;
                }

                // Run on its own task so a dropped caller can't strand the entry in Connecting
                let supervisor = self.supervisor.clone();
                let registry = self.registry.clone();
                let task = tokio::spawn(async move {
                    match supervisor.spawn(&request).await {
                        Ok(spawned) => {
                            if registry.mark_connected(&key, generation, spawned.local_port, spawned.process) {
                                Ok(spawned.local_port)
                            } else {
                                // Disconnected or retried while spawning
                                supervisor.kill(&spawned.process).await?;
                                Err(AppError::ConnectFailed(format!(
                                    "Tunnel {} was disconnected while connecting",
                                    key
                                )))
                            }
                        }
                        Err(e) => {
                            registry.mark_failed(&key, generation, e.to_string());
                            Err(e)
                        }
                    }
                });
                task.await?
            }
        }
    }

    /// Close a tunnel. Closing an unknown key succeeds.
    pub async fn disconnect(&self, key: &TunnelKey) -> AppResult<()> {
        match self.registry.remove(key) {
            Some(entry) => {
                if let Some(process) = entry.process {
                    self.supervisor.kill(&process).await?;
                }
                tracing::info!(key = %key, "Tunnel disconnected");
            }
            None => tracing::debug!(key = %key, "Disconnect of unknown tunnel ignored"),
        }
        Ok(())
    }

    pub fn get(&self, key: &TunnelKey) -> Option<TunnelEntry> {
        self.registry.get(key)
    }

    pub fn list(&self, target_prefix: Option<&str>) -> Vec<TunnelEntry> {
        self.registry.list(target_prefix)
    }

    /// Local port of a Connected tunnel, for launchers and file transfer
    pub fn connected_port(&self, key: &TunnelKey) -> AppResult<u16> {
        let entry = self
            .registry
            .get(key)
            .ok_or_else(|| AppError::TunnelNotFound(key.to_string()))?;
        match (entry.status, entry.local_port) {
            (TunnelStatus::Connected, Some(port)) => Ok(port),
            _ => Err(AppError::TunnelNotConnected(key.to_string())),
        }
    }

    /// Disconnect everything and stop every helper process
    pub async fn shutdown(&self) {
        let entries = self.registry.drain();
        for entry in &entries {
            if let Some(process) = entry.process {
                let _ = self.supervisor.kill(&process).await;
            }
        }
        let stragglers = self.supervisor.shutdown().await;
        tracing::info!(tunnels = entries.len(), stragglers, "Tunnel manager shut down");
    }
}

async fn wait_for_outcome(
    key: &TunnelKey,
    mut rx: tokio::sync::watch::Receiver<TunnelEntry>,
) -> AppResult<u16> {
    loop {
        {
            let entry = rx.borrow_and_update();
            match entry.status {
                TunnelStatus::Connected => {
                    return entry
                        .local_port
                        .ok_or_else(|| AppError::TunnelNotConnected(key.to_string()));
                }
                TunnelStatus::Error => {
                    return Err(AppError::ConnectFailed(
                        entry.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    ));
                }
                TunnelStatus::Connecting | TunnelStatus::Disconnected => {}
            }
        }
        if rx.changed().await.is_err() {
            return Err(AppError::ConnectFailed(format!(
                "Tunnel {} was disconnected while connecting",
                key
            )));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tunnel::supervisor::tests::{request, test_settings, ScriptLauncher};
    use std::net::TcpListener;
    use std::sync::atomic::Ordering;

    fn manager(launcher: Arc<ScriptLauncher>, spawn_timeout_secs: u64) -> TunnelManager {
        let supervisor = Arc::new(TunnelSupervisor::new(launcher, &test_settings(spawn_timeout_secs)));
        TunnelManager::new(Arc::new(TunnelRegistry::new()), supervisor)
    }

    #[tokio::test]
    async fn test_double_connect_spawns_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let launcher = ScriptLauncher::announcing(port);
        let manager = manager(launcher.clone(), 5);

        let (a, b) = tokio::join!(
            manager.connect(request("vm-a", 22)),
            manager.connect(request("vm-a", 22))
        );
        assert_eq!(a.unwrap(), port);
        assert_eq!(b.unwrap(), port);
        assert_eq!(manager.connect(request("vm-a", 22)).await.unwrap(), port);

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.supervisor().owned_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ports_on_same_target_are_independent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(ScriptLauncher::announcing(port), 5);

        manager.connect(request("vm-a", 3389)).await.unwrap();
        manager.connect(request("vm-a", 22)).await.unwrap();
        let keys: Vec<String> = manager.list(None).iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["vm-a:22", "vm-a:3389"]);

        manager.disconnect(&TunnelKey::new("vm-a", 3389)).await.unwrap();
        assert_eq!(manager.connected_port(&TunnelKey::new("vm-a", 22)).unwrap(), port);
        assert!(manager.get(&TunnelKey::new("vm-a", 3389)).is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_fine() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(ScriptLauncher::announcing(port), 5);
        let key = TunnelKey::new("vm-a", 22);

        manager.connect(request("vm-a", 22)).await.unwrap();
        manager.disconnect(&key).await.unwrap();
        manager.disconnect(&key).await.unwrap();
        assert_eq!(manager.supervisor().owned_count(), 0);
        assert!(matches!(manager.connected_port(&key), Err(AppError::TunnelNotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_spawn_lands_in_error_and_can_retry() {
        let launcher = ScriptLauncher::new("echo 'ERROR: permission denied' >&2; exit 1");
        let manager = manager(launcher.clone(), 2);
        let key = TunnelKey::new("vm-a", 22);

        assert!(manager.connect(request("vm-a", 22)).await.is_err());
        let entry = manager.get(&key).unwrap();
        assert_eq!(entry.status, TunnelStatus::Error);
        assert!(entry.error.unwrap().contains("permission denied"));
        assert!(matches!(manager.connected_port(&key), Err(AppError::TunnelNotConnected(_))));

        // Explicit retry goes back through Connecting
        assert!(manager.connect(request("vm-a", 22)).await.is_err());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_entry() {
        let launcher = ScriptLauncher::new("exit 0");
        let manager = manager(launcher.clone(), 1);

        let result = manager.connect(request("vm-a$(id)", 22)).await;
        assert!(result.unwrap_err().is_validation());
        assert!(manager.list(None).is_empty());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_processes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(ScriptLauncher::announcing(port), 5);

        manager.connect(request("vm-a", 22)).await.unwrap();
        manager.connect(request("vm-b", 22)).await.unwrap();
        manager.shutdown().await;

        assert!(manager.list(None).is_empty());
        assert_eq!(manager.supervisor().owned_count(), 0);
    }
}
