use super::health::HealthReport;
use super::{TunnelEntry, TunnelKey, TunnelRequest, TunnelStatus};
use crate::error::AppResult;
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::state::AppState;
use crate::validation;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub key: TunnelKey,
    pub local_port: u16,
}

/// Open (or join) a tunnel
pub async fn tunnel_connect(state: &AppState, mut request: TunnelRequest) -> AppResult<ConnectResponse> {
    // Zones may arrive as full resource URLs
    request.zone = validation::sanitize_zone_from_url(&request.zone)?;
    let key = request.key();
    tracing::info!(key = %key, project = %request.project, zone = %request.zone, "Connect requested");

    match state.tunnels.connect(request).await {
        Ok(local_port) => Ok(ConnectResponse { key, local_port }),
        Err(e) => {
            logging::log_tunnel(
                LogLevel::Error,
                LogSubsystem::Tunnel,
                key.to_string(),
                format!("Connect failed: {}", e),
            );
            Err(e)
        }
    }
}

pub async fn tunnel_disconnect(state: &AppState, key: String) -> AppResult<()> {
    let key: TunnelKey = key.parse()?;
    state.tunnels.disconnect(&key).await
}

pub async fn tunnel_list(state: &AppState, target_prefix: Option<String>) -> AppResult<Vec<TunnelEntry>> {
    Ok(state.tunnels.list(target_prefix.as_deref()))
}

pub async fn tunnel_get(state: &AppState, key: String) -> AppResult<Option<TunnelEntry>> {
    let key: TunnelKey = key.parse()?;
    Ok(state.tunnels.get(&key))
}

pub async fn tunnel_status(state: &AppState, key: String) -> AppResult<TunnelStatus> {
    let key: TunnelKey = key.parse()?;
    Ok(state.tunnels.registry().status(&key))
}

/// Run a health pass now instead of waiting for the next interval
pub async fn tunnel_health_check(state: &AppState) -> AppResult<HealthReport> {
    Ok(state.health.run_once().await)
}
