pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod notify;
pub mod sftp;
pub mod state;
pub mod tunnel;
pub mod validation;

use notify::{ChannelNotifier, FanoutNotifier, LogNotifier, NotificationSink};
use state::AppState;
use std::sync::Arc;

/// Initialize the application and serve the command bridge over stdin/stdout
/// until the UI closes it. Every tunnel is torn down before returning.
pub async fn run_app() -> anyhow::Result<()> {
    // Initialize config directories first
    let config_dir = config::get_config_dir()?;
    std::fs::create_dir_all(&config_dir)?;
    std::fs::create_dir_all(config_dir.join("logs"))?;

    tracing::info!("Cloud Connector config dir: {:?}", config_dir);

    // Initialize log manager
    logging::init_log_manager(config_dir.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialize log manager: {}", e))?;

    let (channel, notifications) = ChannelNotifier::new();
    let notifier: Arc<dyn NotificationSink> =
        Arc::new(FanoutNotifier::new(vec![Box::new(LogNotifier), Box::new(channel)]));

    let state = Arc::new(AppState::new(config_dir, notifier)?);
    state.start_background();

    tracing::info!("Cloud Connector initialized successfully");

    let served = bridge::run(
        state.clone(),
        tokio::io::stdin(),
        tokio::io::stdout(),
        Some(notifications),
    )
    .await;

    state.shutdown().await;
    served?;
    Ok(())
}
