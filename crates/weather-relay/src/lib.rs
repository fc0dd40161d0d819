//! Weather relay.
//!
//! Consumes weather lookup requests from Zenoh, fetches current conditions
//! and forecast for the requested coordinates, normalizes units and
//! republishes one event per lookup keyed by city.
//!
//! A shared dedup ledger keeps at most one lookup per city in flight across
//! every running relay instance.
//!
//! # Layout
//! - [`dedup`]: pending-marker guard and ledger backends (SQLite, in-process)
//! - [`provider`]: weather provider trait and OpenWeather-compatible client
//! - [`normalize`]: unit conversion into [`model::NormalizedEvent`]
//! - [`publisher`]: outbound event sink
//! - [`source`]: inbound request stream
//! - [`pipeline`]: dispatch loop and per-request state machine
//! - [`relay`]: process wiring

pub mod config;
pub mod dedup;
pub mod error;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod publisher;
pub mod relay;
pub mod shutdown;
pub mod source;
pub mod zenoh_session;

pub use config::RelayConfig;
pub use dedup::{DedupGuard, DedupStore, MarkerLease, MemoryStore, SqliteStore};
pub use error::{
    ConfigError, FetchError, NormalizeError, PipelineError, PublishError, RelayError, StoreError,
};
pub use model::{LookupRequest, NormalizedEvent, RawSnapshot};
pub use pipeline::{Outcome, PipelineOptions, RequestPipeline};
pub use provider::{OpenWeatherClient, WeatherProvider};
pub use publisher::{EventSink, ZenohEventPublisher};
pub use relay::run_relay;
pub use source::{ChannelSource, RequestSource, ZenohRequestSource};
