use std::fs;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueueConfig {
    /// Items checked concurrently per batch. Caps load against the object
    /// store regardless of queue length.
    max_concurrent: usize,
    /// Lookups per asset before the queue gives up and serves the original
    /// as a degraded fallback.
    max_attempts: u32,
    /// Pause between batches.
    batch_delay_ms: u64,
}

impl QueueConfig {
    const MAX_CONCURRENT: usize = 4;
    const MAX_ATTEMPTS: u32 = 3;
    const BATCH_DELAY_MS: u64 = 2000;

    /// Programmatic construction for hosts that do not load a TOML file.
    /// Out-of-range values are corrected the same way file values are.
    pub fn new(max_concurrent: usize, max_attempts: u32, batch_delay_ms: u64) -> Self {
        let mut config = QueueConfig {
            max_concurrent,
            max_attempts,
            batch_delay_ms,
        };
        config.ensure_valid();
        config
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    fn ensure_valid(&mut self) {
        // Zero concurrency or zero attempts would stall the queue forever.
        // Inform the user and fall back to the defaults.
        if self.max_concurrent == 0 {
            eprintln!(
                "Config error: queue.max_concurrent must be at least 1 - using default of {}",
                Self::MAX_CONCURRENT
            );
            self.max_concurrent = Self::MAX_CONCURRENT;
        }
        if self.max_attempts == 0 {
            eprintln!(
                "Config error: queue.max_attempts must be at least 1 - using default of {}",
                Self::MAX_ATTEMPTS
            );
            self.max_attempts = Self::MAX_ATTEMPTS;
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_concurrent: Self::MAX_CONCURRENT,
            max_attempts: Self::MAX_ATTEMPTS,
            batch_delay_ms: Self::BATCH_DELAY_MS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SweepConfig {
    /// Interval between sweep ticks over `needs_retry` assets.
    interval_secs: u64,
    /// Delay before the first tick after startup; covers assets that
    /// degraded just before a reload.
    startup_delay_secs: u64,
    /// Pause between flagged assets within one tick, to avoid a burst when
    /// many assets are flagged at once.
    item_delay_ms: u64,
}

impl SweepConfig {
    const INTERVAL_SECS: u64 = 45;
    const STARTUP_DELAY_SECS: u64 = 5;
    const ITEM_DELAY_MS: u64 = 250;

    pub fn new(interval_secs: u64, startup_delay_secs: u64, item_delay_ms: u64) -> Self {
        let mut config = SweepConfig {
            interval_secs,
            startup_delay_secs,
            item_delay_ms,
        };
        config.ensure_valid();
        config
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    fn ensure_valid(&mut self) {
        if self.interval_secs == 0 {
            eprintln!(
                "Config error: sweep.interval_secs must be at least 1 - using default of {}",
                Self::INTERVAL_SECS
            );
            self.interval_secs = Self::INTERVAL_SECS;
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            interval_secs: Self::INTERVAL_SECS,
            startup_delay_secs: Self::STARTUP_DELAY_SECS,
            item_delay_ms: Self::ITEM_DELAY_MS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FallbackConfig {
    /// One-shot emergency timeout from tracker start. Any asset still
    /// without derived URLs and without a retry flag at this point fell
    /// outside normal tracking and gets the original as a stand-in.
    delay_secs: u64,
}

impl FallbackConfig {
    const DELAY_SECS: u64 = 300;

    pub fn new(delay_secs: u64) -> Self {
        let mut config = FallbackConfig { delay_secs };
        config.ensure_valid();
        config
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    fn ensure_valid(&mut self) {
        if self.delay_secs == 0 {
            eprintln!(
                "Config error: fallback.delay_secs must be at least 1 - using default of {}",
                Self::DELAY_SECS
            );
            self.delay_secs = Self::DELAY_SECS;
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            delay_secs: Self::DELAY_SECS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistenceConfig {
    /// Quiet period after an in-memory change before the gallery snapshot is
    /// handed to the persistence sink. Changes during the window coalesce
    /// into one save.
    debounce_ms: u64,
}

impl PersistenceConfig {
    const DEBOUNCE_MS: u64 = 1500;

    pub fn new(debounce_ms: u64) -> Self {
        PersistenceConfig { debounce_ms }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            debounce_ms: Self::DEBOUNCE_MS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TrackerConfig {
    pub queue: QueueConfig,
    pub sweep: SweepConfig,
    pub fallback: FallbackConfig,
    pub persistence: PersistenceConfig,
}

impl TrackerConfig {
    /// Loads the configuration from a TOML file at the given path.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(config_path: &Path) -> Self {
        let default_config = TrackerConfig::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        // Build a Figment instance that uses the defaults merged with the TOML file (if it exists)
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path));

        // Attempt to extract the configuration; on error, log a message and fall back to defaults.
        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.queue.ensure_valid();
        self.sweep.ensure_valid();
        self.fallback.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_sane() {
        let config = TrackerConfig::default();
        assert!(config.queue.max_concurrent() >= 1);
        assert!(config.queue.max_attempts() >= 1);
        assert!(config.sweep.interval() > Duration::ZERO);
        assert!(config.fallback.delay() > Duration::ZERO);
    }

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assetpulse.toml");

        let config = TrackerConfig::load_config(&path);

        assert!(path.exists());
        assert_eq!(config.queue.max_attempts(), QueueConfig::MAX_ATTEMPTS);
    }

    #[test]
    fn test_load_merges_file_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assetpulse.toml");
        fs::write(
            &path,
            "[queue]\nmax_concurrent = 8\nmax_attempts = 5\nbatch_delay_ms = 100\n",
        )
        .unwrap();

        let config = TrackerConfig::load_config(&path);

        assert_eq!(config.queue.max_concurrent(), 8);
        assert_eq!(config.queue.max_attempts(), 5);
        assert_eq!(config.queue.batch_delay(), Duration::from_millis(100));
        // Untouched sections keep their defaults
        assert_eq!(config.sweep.interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assetpulse.toml");
        fs::write(
            &path,
            "[queue]\nmax_concurrent = 0\nmax_attempts = 0\nbatch_delay_ms = 0\n",
        )
        .unwrap();

        let config = TrackerConfig::load_config(&path);

        assert_eq!(config.queue.max_concurrent(), QueueConfig::MAX_CONCURRENT);
        assert_eq!(config.queue.max_attempts(), QueueConfig::MAX_ATTEMPTS);
        // A zero delay is valid policy
        assert_eq!(config.queue.batch_delay(), Duration::ZERO);
    }
}
