//! Process wiring: broker session, ledger, provider, publisher, pipeline.

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RelayConfig;
use crate::dedup::{DedupGuard, DedupStore, MemoryStore, SqliteStore};
use crate::error::{Result, StoreError};
use crate::pipeline::{PipelineOptions, RequestPipeline};
use crate::provider::OpenWeatherClient;
use crate::publisher::ZenohEventPublisher;
use crate::source::ZenohRequestSource;
use crate::zenoh_session::open_session;

/// Open the dedup ledger selected by `config`.
pub fn build_store(config: &RelayConfig) -> std::result::Result<Arc<dyn DedupStore>, StoreError> {
    if config.uses_memory_store() {
        log::warn!("Using a process-local dedup ledger; other instances will not see its markers");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::new(&config.dedup_db_path)?;
    log::info!("Dedup ledger: {}", store.path().display());
    Ok(Arc::new(store))
}

/// Run the relay until `shutdown` fires or the request stream closes.
///
/// Broker connection failure is returned before any request is consumed.
pub async fn run_relay(config: RelayConfig, shutdown: watch::Receiver<()>) -> Result<()> {
    let session = open_session(&config.zenoh_endpoint, &config.zenoh_mode).await?;

    let guard = DedupGuard::new(build_store(&config)?, config.marker_ttl());
    let provider = Arc::new(OpenWeatherClient::new(
        &config.api_url,
        config.api_key(),
        config.fetch_timeout(),
    )?);
    let sink = Arc::new(ZenohEventPublisher::new(
        session.clone(),
        &config.weather_topic,
        config.publish_timeout(),
    ));
    let source = ZenohRequestSource::subscribe(&session, &config.requests_topic).await?;

    let pipeline = RequestPipeline::new(
        guard,
        provider,
        sink,
        PipelineOptions {
            max_in_flight: config.max_in_flight,
            drain_timeout: config.drain_timeout(),
        },
    );

    log::info!(
        "Relaying {} -> {}/<city> (provider {}, up to {} concurrent lookups)",
        config.requests_topic,
        config.weather_topic,
        config.api_url,
        config.max_in_flight
    );
    pipeline.run(source, shutdown).await;

    session.close().await?;
    Ok(())
}
