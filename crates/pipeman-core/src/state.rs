// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipestance identity and lifecycle state.
//!
//! The manager tracks every pipestance in one of five collections keyed by
//! [`PipestanceKey`]: `pending`, `running`, `completed`, `failed` and
//! `copying`. All five live in a single [`Registry`] guarded by one mutex;
//! callers must never hold that lock across an engine call or filesystem
//! operation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::engine::PipestanceHandle;
use crate::notify::{AnalysisTrigger, Notification};

/// Composite identifier `(container, pipeline, psid)` for one pipestance.
///
/// Immutable once created. The dotted rendering `container.pipeline.psid`
/// is the wire format used in the cache file and as scratch directory name,
/// so none of the three components may contain a `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipestanceKey {
    /// Logical grouping (e.g. one flowcell) the pipestance belongs to.
    pub container: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Pipestance id, unique within the container.
    pub psid: String,
}

impl PipestanceKey {
    /// Build a key from its three components.
    pub fn new(
        container: impl Into<String>,
        pipeline: impl Into<String>,
        psid: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            pipeline: pipeline.into(),
            psid: psid.into(),
        }
    }

    /// Fully qualified name used by the job scheduler for this pipestance.
    ///
    /// Must stay identical to the engine's FQName construction so that
    /// `CancelJobs` patterns match the submitted job names.
    pub fn fqname(&self) -> String {
        format!("ID.{}.{}", self.psid, self.pipeline)
    }
}

impl fmt::Display for PipestanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.container, self.pipeline, self.psid)
    }
}

/// Error returned when a dotted key string does not have three components.
#[derive(Debug, thiserror::Error)]
#[error("invalid pipestance key '{0}': expected container.pipeline.psid")]
pub struct ParseKeyError(pub String);

impl FromStr for PipestanceKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(container), Some(pipeline), Some(psid), None)
                if !container.is_empty() && !pipeline.is_empty() && !psid.is_empty() =>
            {
                Ok(Self::new(container, pipeline, psid))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

impl Serialize for PipestanceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PipestanceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Observable lifecycle state of a pipestance.
///
/// Query priority is `copying` > `complete` > `failed` > running (engine
/// state) > `waiting`: a pipestance that is both completed and mid-copy
/// must report `copying` so clients do not assume its output files are
/// stable yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipestanceState {
    /// Completed and currently being migrated off scratch storage.
    Copying,
    /// Terminal success.
    Complete,
    /// Terminal failure (until unfailed or wiped).
    Failed,
    /// In the running set; carries the engine's own state string.
    Running(String),
    /// Invocation or state-changing operation in flight.
    Waiting,
}

impl fmt::Display for PipestanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copying => write!(f, "copying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Running(s) => write!(f, "{}", s),
            Self::Waiting => write!(f, "waiting"),
        }
    }
}

/// All mutable manager state, guarded by a single mutex in the manager.
///
/// Lock discipline: take the lock for map operations only. Engine calls,
/// filesystem work and job backend calls happen outside.
#[derive(Default)]
pub(crate) struct Registry {
    pub completed: BTreeSet<PipestanceKey>,
    pub failed: BTreeSet<PipestanceKey>,
    pub copying: BTreeSet<PipestanceKey>,
    pub pending: HashSet<PipestanceKey>,
    pub running: HashMap<PipestanceKey, Arc<dyn PipestanceHandle>>,
    pub retries_remaining: HashMap<PipestanceKey, u32>,
    pub mail_queue: Vec<Notification>,
    pub analysis_queue: Vec<AnalysisTrigger>,
}

impl Registry {
    /// State of a key, in the documented priority order.
    ///
    /// The running branch reads the handle's cached state string, which is
    /// a cheap accessor and safe to call under the registry lock.
    pub fn state_of(&self, key: &PipestanceKey) -> Option<PipestanceState> {
        if self.copying.contains(key) {
            return Some(PipestanceState::Copying);
        }
        if self.completed.contains(key) {
            return Some(PipestanceState::Complete);
        }
        if self.failed.contains(key) {
            return Some(PipestanceState::Failed);
        }
        if let Some(handle) = self.running.get(key) {
            return Some(PipestanceState::Running(handle.state()));
        }
        if self.pending.contains(key) {
            return Some(PipestanceState::Waiting);
        }
        None
    }

    /// Drop a pending marker, optionally restoring the failed flag after a
    /// state-changing operation aborted partway.
    pub fn remove_pending(&mut self, key: &PipestanceKey, refail: bool) {
        self.pending.remove(key);
        if refail {
            self.failed.insert(key.clone());
        }
    }
}
