use cloud_connector::config::{get_config_dir, AppSettings};

/// Log filter from `RUST_LOG`, then the settings file, then the built-in default
fn log_filter() -> String {
    get_config_dir()
        .ok()
        .and_then(|dir| AppSettings::load(&dir).ok())
        .map(|settings| settings.logging.filter)
        .unwrap_or_else(|| AppSettings::default().logging.filter)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the bridge protocol, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter().into()),
        )
        .init();

    cloud_connector::run_app().await
}
