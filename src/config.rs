//! Runtime configuration read from `COACHBOOK_*` environment variables.
//!
//! A `.env` file in the working directory is loaded first when present.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Knobs consulted by the engine on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum lead time before a booking starts after which it can no
    /// longer be cancelled.
    pub cancel_cutoff: Duration,
    /// Longest a booking operation waits for a coach or student row lock.
    pub lock_timeout: Duration,
    /// CAS attempts per energy posting before giving up.
    pub energy_max_retries: u32,
    /// Delay after the first lost CAS race; doubles per further loss.
    pub energy_backoff: Duration,
    pub energy_max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_cutoff: Duration::from_secs(2 * 3600),
            lock_timeout: Duration::from_secs(5),
            energy_max_retries: 5,
            energy_backoff: Duration::from_millis(1),
            energy_max_backoff: Duration::from_millis(20),
        }
    }
}

impl EngineConfig {
    /// Sleep before CAS attempt `lost + 1`, after `lost` races were lost:
    /// `min(energy_backoff * 2^(lost-1), energy_max_backoff)` scaled by a
    /// random factor in `[0.5, 1.0]` so contenders drift apart.
    pub fn energy_backoff_delay(&self, lost: u32) -> Duration {
        use rand::Rng;

        let exp = lost.saturating_sub(1).min(16) as i32;
        let base = self.energy_backoff.as_secs_f64() * 2f64.powi(exp);
        let capped = base.min(self.energy_max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Everything a host needs to open and run a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            reaper_interval: Duration::from_secs(60),
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl LedgerConfig {
    /// Build from the environment, falling back to defaults for unset or
    /// unparsable values.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let engine_defaults = EngineConfig::default();

        let engine = EngineConfig {
            cancel_cutoff: env_parse::<u64>("COACHBOOK_CANCEL_CUTOFF_HOURS")
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(engine_defaults.cancel_cutoff),
            lock_timeout: env_parse::<u64>("COACHBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(engine_defaults.lock_timeout),
            energy_max_retries: env_parse::<u32>("COACHBOOK_ENERGY_MAX_RETRIES")
                .filter(|n| *n > 0)
                .unwrap_or(engine_defaults.energy_max_retries),
            energy_backoff: env_parse::<u64>("COACHBOOK_ENERGY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(engine_defaults.energy_backoff),
            energy_max_backoff: env_parse::<u64>("COACHBOOK_ENERGY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(engine_defaults.energy_max_backoff),
        };

        Self {
            data_dir: std::env::var("COACHBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: env_parse("COACHBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            reaper_interval: env_parse::<u64>("COACHBOOK_REAPER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            metrics_port: env_parse("COACHBOOK_METRICS_PORT"),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}
