//! streamd - live stream viewing and recording daemon
//!
//! This daemon:
//! 1. Loads configuration from `STREAMD_CONFIG` and `STREAMD_*` overrides
//! 2. Starts the detection history worker backed by SQLite
//! 3. Serves live viewer streams and recording control over HTTP
//! 4. Stops every session and flushes history on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use streamwatch::session::HistoryBinding;
use streamwatch::storage::PERSIST_QUEUE_DEPTH;
use streamwatch::{
    Control, PersistenceWorker, SessionManager, SqliteHistorySink, StreamSourceFactory,
    StreamdConfig, ViewerServer,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StreamdConfig::load()?;
    log::info!(
        "streamd {} starting (default source {})",
        env!("CARGO_PKG_VERSION"),
        config.source.url
    );

    let sink = Arc::new(SqliteHistorySink::open(&config.history.db_path)?);
    let mut persistence =
        PersistenceWorker::spawn(config.history.path.clone(), sink, PERSIST_QUEUE_DEPTH)?;
    let handle = persistence
        .handle()
        .ok_or_else(|| anyhow!("persistence worker has no submit handle"))?;
    log::info!(
        "saving detections of [{}] to {}",
        config.history.detect_types.join(","),
        config.history.path.display()
    );

    let factory = Arc::new(StreamSourceFactory::new(config.source_settings()));
    let manager = Arc::new(
        SessionManager::new(factory, config.session_settings()).with_history(HistoryBinding {
            handle,
            filter: config.category_filter(),
        }),
    );
    let control = Control::new(manager.clone(), config.control_defaults());

    let server = ViewerServer::new(config.server_config(), control).spawn()?;
    log::info!("viewer server listening on {}", server.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("streamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping sessions...");

    server.stop()?;
    manager.shutdown();
    drop(manager);
    persistence.shutdown(config.join_timeout);
    let stats = persistence.stats();
    log::info!(
        "history: {} written, {} dropped, {} failed",
        stats.written,
        stats.dropped,
        stats.failed
    );
    Ok(())
}
