use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::LedgerConfig;
use crate::engine::Engine;
use crate::reaper;

/// An open ledger: the engine plus its background reaper and compactor.
/// Dropping it stops both tasks.
pub struct Ledger {
    engine: Arc<Engine>,
    tasks: Vec<JoinHandle<()>>,
}

impl Ledger {
    /// Open (or create) the ledger under `config.data_dir`, replaying its
    /// WAL. Must be called inside a tokio runtime.
    pub fn open(config: &LedgerConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.wal_path();
        let engine = Arc::new(Engine::new(wal_path.clone(), config.engine.clone())?);

        let reaper_engine = engine.clone();
        let every = config.reaper_interval;
        let reaper_task = tokio::spawn(async move {
            reaper::run_reaper(reaper_engine, every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = config.compact_threshold;
        let compactor_task = tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold, every).await;
        });

        info!("ledger open at {}", wal_path.display());
        Ok(Self {
            engine,
            tasks: vec![reaper_task, compactor_task],
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
