// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terminal-event notifications and the mailer seam.
//!
//! The run loop produces [`Notification`] values; an external mailer
//! consumes them in batches via the manager's copy-and-clear drain, so
//! producers never block on the consumer. Bootstrap pipelines bypass the
//! batch queue and go through [`Mailer::send_immediate`] instead.

use crate::state::PipestanceKey;

/// Immutable description of a terminal pipestance event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Pipestance completed; VDR has already reclaimed intermediates.
    Complete {
        /// Which pipestance.
        key: PipestanceKey,
        /// Bytes reclaimed by VDR.
        vdr_bytes: u64,
        /// Files removed by VDR.
        vdr_files: u64,
    },
    /// Pipestance failed.
    Failed {
        /// Which pipestance.
        key: PipestanceKey,
        /// FQName of the failing stage.
        stage: String,
        /// Human-readable error summary.
        summary: String,
    },
    /// Migration off scratch storage failed; source data is untouched.
    MigrationFailed {
        /// Which pipestance.
        key: PipestanceKey,
        /// Path that failed to copy.
        path: std::path::PathBuf,
        /// The copy error.
        error: String,
    },
}

impl Notification {
    /// The pipestance this notification is about.
    pub fn key(&self) -> &PipestanceKey {
        match self {
            Self::Complete { key, .. } | Self::Failed { key, .. } | Self::MigrationFailed { key, .. } => key,
        }
    }
}

/// Signal that a completed bootstrap pipeline unblocks dependent analyses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisTrigger {
    /// Container (flowcell) whose downstream analyses may now be invoked.
    pub container: String,
}

/// Immediate-delivery channel for bootstrap-pipeline events and alerts.
///
/// Batch delivery of queued notifications is the consumer's business and
/// out of scope here; this trait only covers the bypass path.
pub trait Mailer: Send + Sync {
    /// Deliver one notification right away, outside the batch queue.
    fn send_immediate(&self, note: &Notification);
}

/// Mailer that records notifications to the log only.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_immediate(&self, note: &Notification) {
        match note {
            Notification::Complete {
                key,
                vdr_bytes,
                vdr_files,
            } => {
                tracing::info!(%key, vdr_bytes, vdr_files, "pipestance succeeded");
            }
            Notification::Failed { key, stage, summary } => {
                tracing::warn!(%key, stage, summary, "pipestance failed");
            }
            Notification::MigrationFailed { key, path, error } => {
                tracing::error!(%key, path = %path.display(), error, "pipestance copy failed");
            }
        }
    }
}
