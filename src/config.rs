//! Applier configuration, loaded from an optional YAML file, environment
//! variables, and defaults, then validated into runtime [`Settings`].

use crate::errinput;
use crate::error::Result;

use serde_derive::Deserialize;

use std::sync::atomic::{AtomicU64, Ordering};

/// The default number of writer threads, by platform word size.
const DEFAULT_WRITER_THREADS: usize = if cfg!(target_pointer_width = "64") { 16 } else { 2 };

/// The default per-batch operation count limit.
const DEFAULT_BATCH_LIMIT_OPERATIONS: u64 = 50_000;

/// The default per-batch byte ceiling. The effective limit is the smaller of
/// this and 10% of the oplog's maximum size.
const DEFAULT_BATCH_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

/// Applier configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// The number of writer pool threads (1..=256). Startup-only.
    pub writer_threads: usize,
    /// The maximum number of operations per batch (1..=1,000,000). May be
    /// changed at runtime via [`Settings::set_batch_limit_operations`].
    pub batch_limit_operations: u64,
    /// The configured per-batch byte ceiling.
    pub batch_limit_bytes: u64,
    /// The hostname of the sync source, used to fetch missing documents
    /// during initial sync.
    pub sync_source: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writer_threads: DEFAULT_WRITER_THREADS,
            batch_limit_operations: DEFAULT_BATCH_LIMIT_OPERATIONS,
            batch_limit_bytes: DEFAULT_BATCH_LIMIT_BYTES,
            sync_source: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the given file, if it exists, with
    /// OPLOGTAIL_-prefixed environment variables taking precedence.
    pub fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("writer_threads", DEFAULT_WRITER_THREADS as u64)?
            .set_default("batch_limit_operations", DEFAULT_BATCH_LIMIT_OPERATIONS)?
            .set_default("batch_limit_bytes", DEFAULT_BATCH_LIMIT_BYTES)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("OPLOGTAIL"))
            .build()?
            .try_deserialize()?)
    }

    /// Validates the configuration and converts it into runtime settings.
    pub fn validate(self) -> Result<Settings> {
        if self.writer_threads < 1 || self.writer_threads > 256 {
            return errinput!("writer_threads must be between 1 and 256");
        }
        if self.batch_limit_operations < 1 || self.batch_limit_operations > 1_000_000 {
            return errinput!("batch_limit_operations must be between 1 and 1 million, inclusive");
        }
        if self.batch_limit_bytes < 1 {
            return errinput!("batch_limit_bytes must be at least 1");
        }
        Ok(Settings {
            writer_threads: self.writer_threads,
            batch_limit_operations: AtomicU64::new(self.batch_limit_operations),
            batch_limit_bytes: self.batch_limit_bytes,
            sync_source: self.sync_source,
        })
    }
}

/// Validated runtime settings. The operation count limit is atomic since it
/// can be changed at runtime; the batcher re-reads it once per batch.
#[derive(Debug)]
pub struct Settings {
    pub writer_threads: usize,
    batch_limit_operations: AtomicU64,
    pub batch_limit_bytes: u64,
    pub sync_source: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().validate().expect("default config is valid")
    }
}

impl Settings {
    /// The current per-batch operation count limit.
    pub fn batch_limit_operations(&self) -> u64 {
        self.batch_limit_operations.load(Ordering::Relaxed)
    }

    /// Changes the per-batch operation count limit at runtime. Takes effect
    /// from the next batch.
    pub fn set_batch_limit_operations(&self, ops: u64) -> Result<()> {
        if !(1..=1_000_000).contains(&ops) {
            return errinput!("batch_limit_operations must be between 1 and 1 million, inclusive");
        }
        self.batch_limit_operations.store(ops, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.writer_threads, DEFAULT_WRITER_THREADS);
        assert_eq!(settings.batch_limit_operations(), 50_000);
        assert_eq!(settings.batch_limit_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn validate_bounds() {
        assert!(Config { writer_threads: 0, ..Config::default() }.validate().is_err());
        assert!(Config { writer_threads: 257, ..Config::default() }.validate().is_err());
        assert!(Config { writer_threads: 256, ..Config::default() }.validate().is_ok());
        assert!(Config { batch_limit_operations: 0, ..Config::default() }.validate().is_err());
        assert!(
            Config { batch_limit_operations: 1_000_001, ..Config::default() }.validate().is_err()
        );
    }

    #[test]
    fn load_missing_file_uses_defaults() -> Result<()> {
        let settings = Config::load("/nonexistent/oplogtail.yaml")?.validate()?;
        assert_eq!(settings.batch_limit_operations(), DEFAULT_BATCH_LIMIT_OPERATIONS);
        assert_eq!(settings.sync_source, None);
        Ok(())
    }

    #[test]
    fn load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("oplogtail.yaml");
        std::fs::write(
            &path,
            "writer_threads: 4\nbatch_limit_operations: 1000\nsync_source: primary:27017\n",
        )?;
        let config = Config::load(path.to_str().expect("path is utf-8"))?;
        assert_eq!(config.writer_threads, 4);
        assert_eq!(config.batch_limit_operations, 1000);
        assert_eq!(config.batch_limit_bytes, DEFAULT_BATCH_LIMIT_BYTES);
        assert_eq!(config.sync_source.as_deref(), Some("primary:27017"));
        Ok(())
    }

    #[test]
    fn runtime_ops_limit() {
        let settings = Settings::default();
        settings.set_batch_limit_operations(1).unwrap();
        assert_eq!(settings.batch_limit_operations(), 1);
        assert!(settings.set_batch_limit_operations(0).is_err());
        assert!(settings.set_batch_limit_operations(2_000_000).is_err());
        assert_eq!(settings.batch_limit_operations(), 1);
    }
}
