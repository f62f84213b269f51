// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for manager operations.

use crate::engine::EngineError;

/// Result type using ManagerError.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors surfaced by pipestance manager operations.
///
/// Per-tick failures of a single pipestance are isolated inside the run
/// loop and reported through logging/notifications; this taxonomy covers
/// the synchronous API surface (invoke/kill/unfail/wipe/archive).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// `invoke` on a key that already has lifecycle state.
    #[error("pipestance '{0}' already exists")]
    AlreadyExists(String),

    /// `kill` on a key that is not in the running set.
    #[error("pipestance '{0}' is not running")]
    NotRunning(String),

    /// `unfail`/`wipe` on a key whose state is not exactly failed.
    #[error("pipestance '{0}' is not failed")]
    NotFailed(String),

    /// The key is mid-migration; retry once the copy settles.
    #[error("pipestance '{0}' is being copied")]
    Copying(String),

    /// No discoverable state at all for the key.
    #[error("pipestance '{0}' does not exist")]
    NotExists(String),

    /// No scratch volume has enough free space for a new pipestance.
    #[error("pipestance scratch paths {0} are full")]
    ResourceExhausted(String),

    /// Wipe target does not resolve under a configured scratch root.
    #[error("refusing to wipe pipestance '{0}': not on scratch storage")]
    WipeRefused(String),

    /// Error propagated from the pipeline engine.
    #[error("pipeline engine error: {0}")]
    Engine(#[from] EngineError),

    /// Error from the cluster job backend.
    #[error("job backend error: {0}")]
    JobBackend(String),

    /// Filesystem error while manipulating pipestance paths.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The path the operation was working on.
        path: std::path::PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
