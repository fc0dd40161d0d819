//! Request pipeline: dispatch loop and per-request workers.
//!
//! Each inbound message becomes one worker:
//!
//! ```text
//! Received -> Deduplicated                                   (marker owned elsewhere)
//! Received -> Accepted -> Fetching -> Normalizing -> Publishing -> Cleaned
//! ```
//!
//! Once a worker has accepted a city it releases the marker on every exit,
//! including fetch, normalize and publish failures. Workers for different
//! cities run concurrently, bounded by `max_in_flight`; the dispatch loop
//! stops pulling messages while all slots are busy.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::dedup::DedupGuard;
use crate::error::PipelineError;
use crate::model::LookupRequest;
use crate::normalize::normalize_now;
use crate::provider::WeatherProvider;
use crate::publisher::EventSink;
use crate::source::RequestSource;

/// How a request that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Another worker owns the city; nothing was fetched or published.
    Deduplicated,
    /// The event was published and the marker cleared.
    Published,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on concurrently running workers
    pub max_in_flight: usize,
    /// How long shutdown waits for in-flight workers before aborting them
    pub drain_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct RequestPipeline {
    guard: DedupGuard,
    provider: Arc<dyn WeatherProvider>,
    sink: Arc<dyn EventSink>,
    options: PipelineOptions,
}

impl RequestPipeline {
    pub fn new(
        guard: DedupGuard,
        provider: Arc<dyn WeatherProvider>,
        sink: Arc<dyn EventSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            guard,
            provider,
            sink,
            options,
        }
    }

    /// Decode a raw payload and handle it.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<Outcome, PipelineError> {
        let request = LookupRequest::from_json(payload)?;
        self.handle(&request).await
    }

    /// Run one request through the state machine.
    pub async fn handle(&self, request: &LookupRequest) -> Result<Outcome, PipelineError> {
        let city = request.city.as_str();
        log::info!("Received request for {} ({}, {})", city, request.lat, request.lon);

        let lease = self
            .guard
            .lease(city)
            .await
            .map_err(|source| PipelineError::Store {
                city: city.to_string(),
                source,
            })?;
        let Some(lease) = lease else {
            log::info!("{} is already being processed, skipping", city);
            return Ok(Outcome::Deduplicated);
        };

        let result = self.process(request).await;
        let released = lease.release().await;

        match (result, released) {
            (Ok(()), Ok(())) => {
                log::info!("Event sent and marker cleared for {}", city);
                Ok(Outcome::Published)
            }
            (Ok(()), Err(source)) => Err(PipelineError::Store {
                city: city.to_string(),
                source,
            }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                log::warn!("Failed to clear marker for {}: {}", city, release_err);
                Err(e)
            }
        }
    }

    async fn process(&self, request: &LookupRequest) -> Result<(), PipelineError> {
        let city = request.city.as_str();

        log::debug!("{}: fetching", city);
        let snapshot = self
            .provider
            .fetch(&request.lat, &request.lon)
            .await
            .map_err(|source| PipelineError::Fetch {
                city: city.to_string(),
                source,
            })?;

        log::debug!("{}: normalizing", city);
        let event = normalize_now(city, &snapshot).map_err(|source| PipelineError::Normalize {
            city: city.to_string(),
            source,
        })?;

        log::debug!("{}: publishing", city);
        self.sink
            .publish(city, &event)
            .await
            .map_err(|source| PipelineError::Publish {
                city: city.to_string(),
                source,
            })
    }

    /// Dispatch messages from `source` until it closes or `shutdown` fires.
    ///
    /// Messages are pulled in delivery order, one worker each. On return all
    /// workers have finished or been aborted.
    pub async fn run<S: RequestSource>(&self, mut source: S, mut shutdown: watch::Receiver<()>) {
        let slots = Arc::new(Semaphore::new(self.options.max_in_flight.max(1)));
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    log::info!("Shutdown requested, no longer accepting requests");
                    break;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let payload = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    log::info!("Shutdown requested, no longer accepting requests");
                    break;
                }
                payload = source.next() => match payload {
                    Some(payload) => payload,
                    None => {
                        log::warn!("Request stream ended");
                        break;
                    }
                },
            };

            let pipeline = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                if let Err(e) = pipeline.handle_payload(&payload).await {
                    log::warn!("Request failed: {}", e);
                }
            });

            while let Some(joined) = workers.try_join_next() {
                log_join(joined);
            }
        }

        self.drain(workers).await;
    }

    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }
        log::info!("Waiting for {} in-flight request(s)", workers.len());

        let finished = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = workers.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            log::warn!(
                "Drain timed out after {:?}, aborting {} request(s)",
                self.options.drain_timeout,
                workers.len()
            );
            // Aborted workers drop their leases, which releases the markers
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            log::error!("Request worker panicked: {}", e);
        }
    }
}
