use std::sync::Arc;

use crate::error::RelayError;

/// Build the Zenoh configuration for `endpoint` in the given `mode`.
///
/// Scouting is disabled so the session only talks to the explicit endpoint.
pub fn session_config(endpoint: &str, mode: &str) -> Result<zenoh::Config, RelayError> {
    let invalid = |what: &str, e: zenoh::Error| RelayError::BrokerConnect {
        endpoint: endpoint.to_string(),
        message: format!("Failed to set {}: {}", what, e),
    };

    let mut config = zenoh::Config::default();
    config
        .insert_json5("mode", &format!(r#""{}""#, mode))
        .map_err(|e| invalid("Zenoh mode", e))?;
    config
        .insert_json5("connect/endpoints", &format!(r#"["{}"]"#, endpoint))
        .map_err(|e| invalid("Zenoh endpoint", e))?;
    config
        .insert_json5("scouting/multicast/enabled", "false")
        .map_err(|e| invalid("multicast scouting", e))?;
    config
        .insert_json5("scouting/gossip/enabled", "false")
        .map_err(|e| invalid("gossip scouting", e))?;
    Ok(config)
}

/// Open a Zenoh session; failure here is fatal for the relay.
pub async fn open_session(endpoint: &str, mode: &str) -> Result<Arc<zenoh::Session>, RelayError> {
    log::info!("Connecting to Zenoh at: {} ({} mode)", endpoint, mode);

    let config = session_config(endpoint, mode)?;
    let session = zenoh::open(config)
        .await
        .map_err(|e| RelayError::BrokerConnect {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    log::info!("Connected to Zenoh");
    Ok(Arc::new(session))
}
