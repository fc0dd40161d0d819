use tokio::sync::watch;

/// Set up a shutdown channel triggered by SIGINT/SIGTERM.
///
/// Returns the sender (kept alive by the caller) and a receiver for the
/// dispatch loop.
pub fn setup_shutdown() -> Result<(watch::Sender<()>, watch::Receiver<()>), ctrlc::Error> {
    let (tx, rx) = watch::channel(());
    let shutdown_tx = tx.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    })?;
    Ok((tx, rx))
}
