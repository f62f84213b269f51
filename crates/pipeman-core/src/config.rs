// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// 1.5 terabytes, the default free-space floor for scratch allocation.
pub const DEFAULT_MIN_SCRATCH_BYTES: u64 = 1024 * 1024 * 1024 * 1024 * 3 / 2;

/// Pipestance manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which pipestances live (`<root>/container/pipeline/psid`).
    pub pipestances_path: PathBuf,
    /// Candidate scratch volumes for new pipestances.
    pub scratch_paths: Vec<PathBuf>,
    /// Path of the JSON state cache file.
    pub cache_path: PathBuf,
    /// Root of the fail coop (dated failure archive).
    pub fail_coop_path: PathBuf,
    /// Name of this manager instance, recorded in failure archives.
    pub instance_name: String,
    /// Version directory name the HEAD symlink chain points through.
    pub pipeline_version: String,
    /// Pipeline whose completion triggers downstream analyses and whose
    /// notifications bypass the batch mail queue. `None` disables both.
    pub bootstrap_pipeline: Option<String>,
    /// Minimum free bytes a scratch volume must have to qualify.
    pub min_scratch_bytes: u64,
    /// Interval between process-loop ticks.
    pub process_interval: Duration,
    /// Interval between clean-loop sweeps.
    pub clean_interval: Duration,
    /// Age after which an idle scratch directory is considered stale.
    pub scratch_expiration: Duration,
    /// Cap on concurrently processed pipestances within one tick.
    pub max_concurrent_refreshes: usize,
    /// Automatic retries for transient failures before a pipestance is
    /// marked failed for good. Zero disables auto-retry.
    pub default_retries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PIPEMAN_PIPESTANCES_PATH`: pipestances root directory
    /// - `PIPEMAN_SCRATCH_PATHS`: colon-separated scratch volumes
    /// - `PIPEMAN_CACHE_PATH`: state cache file path
    /// - `PIPEMAN_FAIL_COOP_PATH`: failure archive root
    ///
    /// Optional (with defaults):
    /// - `PIPEMAN_INSTANCE_NAME` (default: `pipeman`)
    /// - `PIPEMAN_PIPELINE_VERSION` (default: `current`)
    /// - `PIPEMAN_BOOTSTRAP_PIPELINE` (default: unset)
    /// - `PIPEMAN_MIN_SCRATCH_BYTES` (default: 1.5 TB)
    /// - `PIPEMAN_PROCESS_INTERVAL_MS` (default: 3000)
    /// - `PIPEMAN_CLEAN_INTERVAL_HOURS` (default: 12)
    /// - `PIPEMAN_SCRATCH_EXPIRATION_DAYS` (default: 14)
    /// - `PIPEMAN_MAX_CONCURRENT_REFRESHES` (default: 32)
    /// - `PIPEMAN_DEFAULT_RETRIES` (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let pipestances_path = PathBuf::from(required("PIPEMAN_PIPESTANCES_PATH")?);

        let scratch_raw = required("PIPEMAN_SCRATCH_PATHS")?;
        let scratch_paths: Vec<PathBuf> = scratch_raw
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if scratch_paths.is_empty() {
            return Err(ConfigError::Invalid(
                "PIPEMAN_SCRATCH_PATHS",
                "must list at least one path",
            ));
        }

        let cache_path = PathBuf::from(required("PIPEMAN_CACHE_PATH")?);
        let fail_coop_path = PathBuf::from(required("PIPEMAN_FAIL_COOP_PATH")?);

        let instance_name =
            std::env::var("PIPEMAN_INSTANCE_NAME").unwrap_or_else(|_| "pipeman".to_string());
        let pipeline_version =
            std::env::var("PIPEMAN_PIPELINE_VERSION").unwrap_or_else(|_| "current".to_string());
        let bootstrap_pipeline = std::env::var("PIPEMAN_BOOTSTRAP_PIPELINE").ok();

        let min_scratch_bytes = parsed(
            "PIPEMAN_MIN_SCRATCH_BYTES",
            DEFAULT_MIN_SCRATCH_BYTES,
            "must be a byte count",
        )?;
        let process_interval_ms: u64 =
            parsed("PIPEMAN_PROCESS_INTERVAL_MS", 3000, "must be milliseconds")?;
        let clean_interval_hours: u64 =
            parsed("PIPEMAN_CLEAN_INTERVAL_HOURS", 12, "must be hours")?;
        let scratch_expiration_days: u64 =
            parsed("PIPEMAN_SCRATCH_EXPIRATION_DAYS", 14, "must be days")?;
        let max_concurrent_refreshes: usize = parsed(
            "PIPEMAN_MAX_CONCURRENT_REFRESHES",
            32,
            "must be a positive integer",
        )?;
        if max_concurrent_refreshes == 0 {
            return Err(ConfigError::Invalid(
                "PIPEMAN_MAX_CONCURRENT_REFRESHES",
                "must be a positive integer",
            ));
        }
        let default_retries: u32 =
            parsed("PIPEMAN_DEFAULT_RETRIES", 0, "must be a non-negative integer")?;

        Ok(Self {
            pipestances_path,
            scratch_paths,
            cache_path,
            fail_coop_path,
            instance_name,
            pipeline_version,
            bootstrap_pipeline,
            min_scratch_bytes,
            process_interval: Duration::from_millis(process_interval_ms),
            clean_interval: Duration::from_secs(clean_interval_hours * 3600),
            scratch_expiration: Duration::from_secs(scratch_expiration_days * 24 * 3600),
            max_concurrent_refreshes,
            default_retries,
        })
    }

    /// Configuration rooted at explicit paths with all defaults, for
    /// embedding and tests.
    pub fn with_roots(
        pipestances_path: impl Into<PathBuf>,
        scratch_paths: Vec<PathBuf>,
        cache_path: impl Into<PathBuf>,
        fail_coop_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipestances_path: pipestances_path.into(),
            scratch_paths,
            cache_path: cache_path.into(),
            fail_coop_path: fail_coop_path.into(),
            instance_name: "pipeman".to_string(),
            pipeline_version: "current".to_string(),
            bootstrap_pipeline: None,
            min_scratch_bytes: DEFAULT_MIN_SCRATCH_BYTES,
            process_interval: Duration::from_millis(3000),
            clean_interval: Duration::from_secs(12 * 3600),
            scratch_expiration: Duration::from_secs(14 * 24 * 3600),
            max_concurrent_refreshes: 32,
            default_retries: 0,
        }
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parsed<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
