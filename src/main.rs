use tracing::info;

use coachbook::config::LedgerConfig;
use coachbook::ledger::Ledger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = LedgerConfig::from_env();
    coachbook::observability::init(config.metrics_port)?;

    let ledger = Ledger::open(&config)?;
    let engine = ledger.engine();
    info!("coachbook ledger running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  cancel cutoff: {:?}", engine.config().cancel_cutoff);
    info!("  lock timeout: {:?}", engine.config().lock_timeout);
    info!("  reaper interval: {:?}", config.reaper_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Run the background tasks until SIGTERM or ctrl-c.
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, compacting WAL");
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    drop(ledger);
    info!("coachbook stopped");
    Ok(())
}
