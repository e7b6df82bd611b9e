use crate::config::AppSettings;
use crate::error::AppResult;
use crate::logging::{self, record_tunnel_event};
use crate::notify::NotificationSink;
use crate::tunnel::supervisor::{IapTunnelLauncher, TunnelLauncher};
use crate::tunnel::{HealthMonitor, HealthMonitorHandle, TunnelManager, TunnelRegistry, TunnelSupervisor};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Global application state
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<RwLock<AppSettings>>,
    pub registry: Arc<TunnelRegistry>,
    pub tunnels: Arc<TunnelManager>,
    pub health: Arc<HealthMonitor>,
    monitor: Mutex<Option<HealthMonitorHandle>>,
    recorder: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(config_dir: PathBuf, notifier: Arc<dyn NotificationSink>) -> AppResult<Self> {
        let settings = AppSettings::load(&config_dir)?;
        let launcher = Arc::new(IapTunnelLauncher::new(&settings.tunnel));
        Ok(Self::with_launcher(config_dir, settings, launcher, notifier))
    }

    pub fn with_launcher(
        config_dir: PathBuf,
        settings: AppSettings,
        launcher: Arc<dyn TunnelLauncher>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let supervisor = Arc::new(TunnelSupervisor::new(launcher, &settings.tunnel));
        let tunnels = Arc::new(TunnelManager::new(registry.clone(), supervisor.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            supervisor,
            notifier,
            &settings.health,
        ));

        Self {
            config_dir,
            settings: Arc::new(RwLock::new(settings)),
            registry,
            tunnels,
            health,
            monitor: Mutex::new(None),
            recorder: Mutex::new(None),
        }
    }

    /// Start the health monitor and the event recorder. Must run inside a Tokio runtime.
    pub fn start_background(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(self.health.clone().start());
        }

        let mut recorder = self.recorder.lock();
        if recorder.is_none() {
            let mut events = self.registry.subscribe();
            *recorder = Some(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if let Some(manager) = logging::get_log_manager() {
                                record_tunnel_event(manager, &event);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event recorder fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    /// Stop background work, disconnect every tunnel and reap every helper
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        self.tunnels.shutdown().await;

        let recorder = self.recorder.lock().take();
        if let Some(recorder) = recorder {
            recorder.abort();
        }
        tracing::info!("Application state shut down");
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use crate::tunnel::supervisor::tests::{request, ScriptLauncher};
    use std::net::TcpListener;

    pub(crate) fn test_state(launcher: Arc<ScriptLauncher>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings::default();
        settings.tunnel.bind_host = "127.0.0.1".to_string();
        settings.tunnel.spawn_timeout_secs = 5;
        let (notifier, _rx) = ChannelNotifier::new();
        let state = AppState::with_launcher(dir.path().to_path_buf(), settings, launcher, Arc::new(notifier));
        (state, dir)
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (state, _dir) = test_state(ScriptLauncher::announcing(port));
        state.start_background();

        state.tunnels.connect(request("vm-a", 22)).await.unwrap();
        state.tunnels.connect(request("vm-a", 3389)).await.unwrap();
        assert_eq!(state.registry.len(), 2);

        state.shutdown().await;
        assert!(state.registry.is_empty());
        assert_eq!(state.tunnels.supervisor().owned_count(), 0);
    }
}
