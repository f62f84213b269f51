// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable JSON snapshot of the manager's lifecycle sets.
//!
//! Written after every processing round, read once at startup. The wire
//! format is `{"completed": {key: true}, "failed": {...}, "copying": {...},
//! "running": {...}}`; a missing or unparsable file is not fatal — the
//! manager falls back to a full directory inventory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::PipestanceKey;

/// Persisted view of the lifecycle sets. `running` holds keys only; the
/// handles are re-created by reattaching through the engine at load time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Keys with terminal success.
    #[serde(with = "flag_map", default)]
    pub completed: BTreeSet<PipestanceKey>,
    /// Keys with terminal failure.
    #[serde(with = "flag_map", default)]
    pub failed: BTreeSet<PipestanceKey>,
    /// Keys mid-migration at snapshot time.
    #[serde(with = "flag_map", default)]
    pub copying: BTreeSet<PipestanceKey>,
    /// Keys that were in the running set at snapshot time.
    #[serde(with = "flag_map", default)]
    pub running: BTreeSet<PipestanceKey>,
}

/// Keys are stored as a `{key: true}` map for compatibility with the
/// on-disk cache format; false entries are dropped on read.
mod flag_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        set: &BTreeSet<PipestanceKey>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<&PipestanceKey, bool> = set.iter().map(|k| (k, true)).collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<PipestanceKey>, D::Error> {
        let map = BTreeMap::<PipestanceKey, bool>::deserialize(deserializer)?;
        Ok(map.into_iter().filter(|(_, v)| *v).map(|(k, _)| k).collect())
    }
}

/// Errors reading the cache file. Both variants are recoverable: the
/// caller re-inventories the pipestance directories instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache file could not be read.
    #[error("could not read cache file: {0}")]
    Io(#[from] std::io::Error),

    /// The cache file contents did not parse.
    #[error("could not parse cache file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads and rewrites the on-disk cache file.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    /// Store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the cache file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the snapshot from disk.
    pub async fn load(&self) -> Result<CacheSnapshot, CacheError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the snapshot, creating parent directories as needed.
    pub async fn store(&self, snapshot: &CacheSnapshot) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        tokio::fs::write(&self.path, bytes).await
    }
}
