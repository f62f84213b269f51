// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fail coop: an archive of failure records, bucketed by date.
//!
//! Each failure gets its own directory under `<root>/<YYYY-MM-DD>/`,
//! named `<instance>-<container>.<pipeline>.<psid>` with a numeric
//! suffix when the same pipestance fails more than once on one day.
//! The directory holds a `summary.json` record plus best-effort copies
//! of whatever diagnostic files the failure surfaced.
//!
//! Archiving never fails a pipestance twice: missing diagnostic files
//! are logged and skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::engine::FatalError;
use crate::state::PipestanceKey;

/// Fail-coop write failure.
#[derive(Debug, thiserror::Error)]
pub enum CoopError {
    /// Filesystem operation failed.
    #[error("fail coop: {op} {path}: {source}")]
    Io {
        /// Operation being attempted.
        op: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Could not encode the summary record.
    #[error("fail coop: encoding summary: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CoopError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The record written as `summary.json` in each archive directory.
#[derive(Debug, Serialize)]
struct CoopRecord<'a> {
    date: DateTime<Utc>,
    instance: &'a str,
    container: &'a str,
    pipeline: &'a str,
    psid: &'a str,
    fqname: String,
    stage: &'a str,
    preflight: bool,
    kind: &'a str,
    summary: &'a str,
    errlog: &'a str,
    invocation: &'a str,
}

/// Writer for the dated failure archive.
#[derive(Debug, Clone)]
pub struct FailCoop {
    root: PathBuf,
    instance: String,
}

impl FailCoop {
    /// Archive writer rooted at `root`, tagging records with `instance`.
    pub fn new(root: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            instance: instance.into(),
        }
    }

    /// Archive one failure. `invocation` is the pipeline invocation source
    /// for the record; pass an empty string if it could not be read.
    /// Returns the directory the record was written to.
    ///
    /// Synchronous; run on a blocking worker thread.
    pub fn archive(
        &self,
        key: &PipestanceKey,
        fatal: &FatalError,
        invocation: &str,
    ) -> Result<PathBuf, CoopError> {
        let now = Utc::now();
        let bucket = self.root.join(now.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&bucket).map_err(|e| CoopError::io("mkdir", &bucket, e))?;

        let dir = unique_dir(&bucket, &format!("{}-{}", self.instance, key));
        fs::create_dir(&dir).map_err(|e| CoopError::io("mkdir", &dir, e))?;

        let record = CoopRecord {
            date: now,
            instance: &self.instance,
            container: &key.container,
            pipeline: &key.pipeline,
            psid: &key.psid,
            fqname: key.fqname(),
            stage: &fatal.stage,
            preflight: fatal.preflight,
            kind: &fatal.kind,
            summary: &fatal.summary,
            errlog: &fatal.errlog,
            invocation,
        };
        let summary_path = dir.join("summary.json");
        let body = serde_json::to_vec_pretty(&record)?;
        fs::write(&summary_path, body).map_err(|e| CoopError::io("write", &summary_path, e))?;

        for src in &fatal.paths {
            let Some(name) = src.file_name() else { continue };
            if let Err(e) = fs::copy(src, dir.join(name)) {
                warn!(path = %src.display(), error = %e, "skipping diagnostic file");
            }
        }
        Ok(dir)
    }
}

/// Pick an unused directory name under `bucket`: `base` if free,
/// otherwise `base-<n>` one past the highest suffix already taken.
fn unique_dir(bucket: &Path, base: &str) -> PathBuf {
    let mut taken: Option<u32> = None;
    if let Ok(entries) = fs::read_dir(bucket) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == base {
                taken = Some(taken.unwrap_or(0));
            } else if let Some(n) = name
                .strip_prefix(base)
                .and_then(|r| r.strip_prefix('-'))
                .and_then(|r| r.parse::<u32>().ok())
            {
                taken = Some(taken.map_or(n, |m| m.max(n)));
            }
        }
    }
    match taken {
        None => bucket.join(base),
        Some(n) => bucket.join(format!("{base}-{}", n + 1)),
    }
}
