// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem layout of a pipestance and its symlink chain.
//!
//! Every pipestance is addressed through `HEAD`:
//!
//! ```text
//! <root>/<container>/<pipeline>/<psid>/HEAD
//!     -> <root>/<container>/<pipeline>/<psid>/<version>   (aggregate path)
//!         -> <scratch>/<container>.<pipeline>.<psid>      (while on scratch)
//! ```
//!
//! Once migration completes, the aggregate path is a plain directory and
//! the chain collapses. [`PipestanceLayout::resolve`] computes which of
//! the two states holds as an explicit [`PsLocation`], so nothing else in
//! the crate infers state from raw symlink inspection.

use std::io;
use std::path::{Path, PathBuf};

use crate::state::PipestanceKey;

/// Where a pipestance's data currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsLocation {
    /// Still on scratch: the aggregate path is a symlink to the scratch
    /// tree. `target` may dangle if a migration was interrupted.
    Scratch {
        /// The aggregate path (the symlink itself).
        link: PathBuf,
        /// The scratch directory the link points at.
        target: PathBuf,
    },
    /// Migrated: the aggregate path is a plain directory.
    Migrated(PathBuf),
}

/// Path construction and resolution for the pipestance tree.
#[derive(Debug, Clone)]
pub struct PipestanceLayout {
    root: PathBuf,
    version: String,
    scratch_roots: Vec<PathBuf>,
}

impl PipestanceLayout {
    /// Layout rooted at `root`, using `version` as the aggregate directory
    /// name under each psid.
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>, scratch_roots: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
            scratch_roots,
        }
    }

    /// The pipestances root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the HEAD symlink and version directories.
    pub fn ps_dir(&self, key: &PipestanceKey) -> PathBuf {
        self.root
            .join(&key.container)
            .join(&key.pipeline)
            .join(&key.psid)
    }

    /// Stable external address of the pipestance.
    pub fn head_path(&self, key: &PipestanceKey) -> PathBuf {
        self.ps_dir(key).join("HEAD")
    }

    /// Aggregate (versioned) path HEAD points at.
    pub fn aggregate_path(&self, key: &PipestanceKey) -> PathBuf {
        self.ps_dir(key).join(&self.version)
    }

    /// Name of the pipestance's directory on a scratch volume.
    pub fn scratch_dir_name(&self, key: &PipestanceKey) -> String {
        key.to_string()
    }

    /// Scratch directory for the pipestance on the given volume.
    pub fn scratch_ps_path(&self, scratch_root: &Path, key: &PipestanceKey) -> PathBuf {
        scratch_root.join(self.scratch_dir_name(key))
    }

    /// Whether `path` is rooted under one of the configured scratch volumes.
    pub fn is_on_scratch(&self, path: &Path) -> bool {
        self.scratch_roots.iter().any(|root| path.starts_with(root))
    }

    /// Resolve the real location of a pipestance through the HEAD chain.
    ///
    /// Errors if HEAD is missing; a dangling scratch target is not an
    /// error here (the migrator handles interrupted-copy recovery).
    pub fn resolve(&self, key: &PipestanceKey) -> io::Result<PsLocation> {
        let head = self.head_path(key);
        let aggregate = read_link_abs(&head)?;
        match aggregate.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = read_link_abs(&aggregate)?;
                Ok(PsLocation::Scratch {
                    link: aggregate,
                    target,
                })
            }
            Ok(_) => Ok(PsLocation::Migrated(aggregate)),
            Err(e) => Err(e),
        }
    }
}

/// Read a symlink, resolving a relative target against the link's parent.
pub(crate) fn read_link_abs(link: &Path) -> io::Result<PathBuf> {
    let target = std::fs::read_link(link)?;
    if target.is_absolute() {
        Ok(target)
    } else {
        Ok(link.parent().unwrap_or_else(|| Path::new("")).join(target))
    }
}
