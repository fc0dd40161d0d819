use anyhow::Context;
use argh::FromArgs;
use weather_relay::{zenoh_session::open_session, LookupRequest};

#[derive(FromArgs)]
/// Publish a single weather lookup request
struct Args {
    /// city name; also the key of the resulting weather event
    #[argh(option)]
    city: String,

    /// latitude
    #[argh(option)]
    lat: String,

    /// longitude
    #[argh(option)]
    lon: String,

    /// zenoh endpoint to connect to
    /// Default: ZENOH_ENDPOINT or tcp/127.0.0.1:7447
    #[argh(option, short = 'e')]
    endpoint: Option<String>,

    /// key expression requests are published on
    #[argh(option, short = 't', default = "String::from(\"requests\")")]
    topic: String,

    /// zenoh session mode (client or peer)
    #[argh(option, short = 'm', default = "String::from(\"client\")")]
    mode: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Args = argh::from_env();
    let endpoint = args
        .endpoint
        .or_else(|| std::env::var("ZENOH_ENDPOINT").ok())
        .unwrap_or_else(|| "tcp/127.0.0.1:7447".to_string());

    let request = LookupRequest::new(args.city, args.lat, args.lon);
    let payload = request.to_json().context("Failed to encode request")?;

    let session = open_session(&endpoint, &args.mode).await?;
    session
        .put(&args.topic, payload)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to publish request: {}", e))?;
    log::info!("Requested weather for {} on {}", request.city, args.topic);

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    Ok(())
}
