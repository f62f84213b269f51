// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborator interfaces: pipeline engine and cluster job backend.
//!
//! The manager never interprets pipeline definitions or schedules chunks
//! itself; it drives an opaque [`PipelineEngine`] and per-execution
//! [`PipestanceHandle`]s, and cancels cluster jobs through a [`JobBackend`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use std::sync::Arc;

/// Opaque error surfaced from the pipeline engine.
#[derive(Debug, Clone)]
pub struct EngineError(String);

impl EngineError {
    /// Wrap an engine failure message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EngineError {}

/// Bytes and file count reclaimed by a VDR pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VdrKillReport {
    /// Number of files removed.
    pub count: u64,
    /// Total bytes reclaimed.
    pub size: u64,
}

/// Diagnostic detail extracted from a failed pipestance.
#[derive(Debug, Clone, Default)]
pub struct FatalError {
    /// Fully qualified name of the failing stage.
    pub stage: String,
    /// Whether the failing stage was a preflight check.
    pub preflight: bool,
    /// Human-readable failure summary.
    pub summary: String,
    /// Raw error log text.
    pub errlog: String,
    /// Error classification (e.g. `errors`, `assert`).
    pub kind: String,
    /// Metadata files worth archiving for diagnosis.
    pub paths: Vec<PathBuf>,
}

/// One live pipeline execution, owned by the manager while running.
///
/// `state` must be a cheap accessor over cached state (it is read under
/// the registry lock); everything async may touch disk or the scheduler.
#[async_trait]
pub trait PipestanceHandle: Send + Sync {
    /// Re-read on-disk metadata and recompute the overall state.
    async fn refresh_state(&self) -> Result<(), EngineError>;

    /// Cached overall state string (`running`, `complete`, `failed`, ...).
    fn state(&self) -> String;

    /// Advance any nodes whose dependencies are satisfied.
    async fn step_nodes(&self);

    /// Check liveness heartbeats of outstanding jobs, failing stalled ones.
    async fn check_heartbeats(&self);

    /// Reclaim volatile intermediate data after completion.
    async fn vdr_kill(&self) -> VdrKillReport;

    /// Engine post-processing hook run once on completion.
    async fn post_process(&self);

    /// Reset failed nodes so the pipestance can run again.
    async fn reset(&self) -> Result<(), EngineError>;

    /// Surrender the engine-side lock on this pipestance.
    fn unlock(&self);

    /// Terminate all in-flight work for this pipestance.
    async fn kill(&self);

    /// Fatal-error detail; meaningful only when the state is failed.
    fn fatal_error(&self) -> FatalError;

    /// FQNames of currently failed stages (for backend job cancellation).
    fn failed_stage_fqnames(&self) -> Vec<String>;

    /// Whether the current failure looks transient (worth auto-retrying).
    fn error_is_transient(&self) -> bool;
}

/// Invocation request passed to the engine.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Pipeline invocation source.
    pub src: String,
    /// Pipestance id.
    pub psid: String,
    /// Path the pipestance should live at (the aggregate path).
    pub path: PathBuf,
    /// Arbitrary tags recorded with the pipestance.
    pub tags: Vec<String>,
}

/// The pipeline execution engine, consumed as an opaque capability.
///
/// Both constructors return handles with metadata fully loaded; the
/// manager relies on that to report accurate state on the next query.
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Pipelines this engine knows how to run (used for inventory walks).
    fn pipeline_names(&self) -> Vec<String>;

    /// Compile the invocation source and construct a new pipestance.
    async fn invoke(&self, req: InvokeRequest) -> Result<Arc<dyn PipestanceHandle>, EngineError>;

    /// Reattach to an existing on-disk pipestance.
    async fn reattach(
        &self,
        psid: &str,
        path: &Path,
    ) -> Result<Arc<dyn PipestanceHandle>, EngineError>;
}

/// Cluster scheduler interface for cancelling submitted jobs.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Cancel all jobs matching the fqname pattern, returning combined
    /// scheduler output. "Job does not exist" responses come back as `Err`
    /// with that output; the caller decides whether that counts as success.
    async fn cancel_jobs(&self, fqname_pattern: &str) -> Result<String, String>;
}

/// Whether scheduler output reports that the jobs were already gone.
///
/// Killing a pipestance races with natural completion; that outcome is a
/// success, not a failure.
pub fn jobs_already_gone(output: &str) -> bool {
    output.contains("does not exist")
}

/// [`JobBackend`] that shells out to `qdel`.
pub struct ShellJobBackend {
    program: String,
}

impl ShellJobBackend {
    /// Backend invoking the given cancel program (typically `qdel`).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ShellJobBackend {
    fn default() -> Self {
        Self::new("qdel")
    }
}

#[async_trait]
impl JobBackend for ShellJobBackend {
    async fn cancel_jobs(&self, fqname_pattern: &str) -> Result<String, String> {
        let result = tokio::process::Command::new(&self.program)
            .arg(format!("{}*", fqname_pattern))
            .output()
            .await;
        match result {
            Ok(Output { status, stdout, stderr, .. }) => {
                let mut combined = String::from_utf8_lossy(&stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&stderr));
                if status.success() {
                    Ok(combined)
                } else {
                    Err(combined)
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}
