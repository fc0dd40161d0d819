//! Inbound side: raw request payloads in delivery order.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;
use zenoh::Session;

use crate::error::RelayError;

/// A stream of raw request payloads.
#[async_trait]
pub trait RequestSource: Send {
    /// Next payload, or `None` once the stream is closed.
    async fn next(&mut self) -> Option<Vec<u8>>;
}

/// Subscriber on the inbound requests key expression.
pub struct ZenohRequestSource {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl ZenohRequestSource {
    pub async fn subscribe(session: &Arc<Session>, key_expr: &str) -> Result<Self, RelayError> {
        let subscriber = session
            .declare_subscriber(key_expr.to_string())
            .await
            .map_err(|e| RelayError::Zenoh(format!("Failed to subscribe to {}: {}", key_expr, e)))?;
        log::info!("Subscribed to requests on {}", key_expr);
        Ok(Self { subscriber })
    }
}

#[async_trait]
impl RequestSource for ZenohRequestSource {
    async fn next(&mut self) -> Option<Vec<u8>> {
        match self.subscriber.recv_async().await {
            Ok(sample) => Some(sample.payload().to_bytes().to_vec()),
            Err(e) => {
                log::warn!("Request subscriber closed: {}", e);
                None
            }
        }
    }
}

/// In-process source fed through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl RequestSource for ChannelSource {
    async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}
