//! Outbound side: publish one normalized event per completed lookup.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use zenoh::bytes::ZBytes;
use zenoh::qos::CongestionControl;
use zenoh::Session;

use crate::error::PublishError;
use crate::model::NormalizedEvent;

/// Destination for normalized events, keyed by city.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish `event` under `city` and wait until the transport accepted it.
    async fn publish(&self, city: &str, event: &NormalizedEvent) -> Result<(), PublishError>;
}

/// Publishes JSON events on `{prefix}/{city}`.
///
/// The city is also sent verbatim as the sample attachment, since the key
/// expression chunk has reserved characters replaced.
pub struct ZenohEventPublisher {
    session: Arc<Session>,
    prefix: String,
    timeout: Duration,
}

impl ZenohEventPublisher {
    pub fn new(session: Arc<Session>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn key_for(&self, city: &str) -> String {
        format!("{}/{}", self.prefix, key_chunk(city))
    }
}

#[async_trait]
impl EventSink for ZenohEventPublisher {
    async fn publish(&self, city: &str, event: &NormalizedEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;
        let key = self.key_for(city);

        let put = self
            .session
            .put(&key, payload)
            .congestion_control(CongestionControl::Block)
            .attachment(ZBytes::from(city.as_bytes().to_vec()));

        tokio::time::timeout(self.timeout, put)
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))??;

        log::info!("Published weather event for {} on {}", city, key);
        Ok(())
    }
}

/// Make `city` usable as a single key expression chunk.
///
/// Separators, wildcards and whitespace become `_`.
pub fn key_chunk(city: &str) -> String {
    let chunk: String = city
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '*' | '$' | '?' | '#' | '@' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    if chunk.is_empty() {
        "_".to_string()
    } else {
        chunk
    }
}
