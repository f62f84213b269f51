// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scratch volume selection for newly invoked pipestances.
//!
//! Round-robin across the configured volumes: each allocation scans from a
//! rotating index, takes the first volume with enough free space, and
//! advances the index past it. This spreads load; it is not
//! capacity-aware placement.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ManagerError;

/// Free-space probe, seam for testing the allocator without real volumes.
pub trait FreeSpace: Send + Sync {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    fn bytes_available(&self, path: &Path) -> io::Result<u64>;
}

/// [`FreeSpace`] backed by the OS disk list via `sysinfo`.
///
/// Matches `path` to the disk with the longest mount-point prefix. The
/// disk list is refreshed on every call; allocations are rare enough that
/// this does not matter.
#[derive(Debug, Default)]
pub struct SysinfoFreeSpace;

impl FreeSpace for SysinfoFreeSpace {
    fn bytes_available(&self, path: &Path) -> io::Result<u64> {
        let resolved = path.canonicalize()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted volume contains {}", resolved.display()),
                )
            })
    }
}

/// Selects a scratch volume for each new pipestance.
pub struct ScratchAllocator {
    paths: Vec<PathBuf>,
    min_bytes: u64,
    index: Mutex<usize>,
    probe: Box<dyn FreeSpace>,
}

impl ScratchAllocator {
    /// Allocator over the given volumes with the given free-space floor.
    pub fn new(paths: Vec<PathBuf>, min_bytes: u64) -> Self {
        Self::with_probe(paths, min_bytes, Box::new(SysinfoFreeSpace))
    }

    /// Allocator with an injected free-space probe.
    pub fn with_probe(paths: Vec<PathBuf>, min_bytes: u64, probe: Box<dyn FreeSpace>) -> Self {
        Self {
            paths,
            min_bytes,
            index: Mutex::new(0),
            probe,
        }
    }

    /// The configured scratch volumes.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Pick a volume for a new pipestance.
    ///
    /// Wraps exactly once through the candidate list starting at the
    /// rotating index. Fails with `ResourceExhausted` naming every
    /// candidate when none has at least the free-space floor.
    pub fn allocate(&self) -> Result<PathBuf, ManagerError> {
        // The index is a bare counter; recover it if a holder panicked.
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..self.paths.len() {
            let candidate = &self.paths[*index];
            *index = (*index + 1) % self.paths.len();

            match self.probe.bytes_available(candidate) {
                Ok(avail) if avail >= self.min_bytes => return Ok(candidate.clone()),
                Ok(avail) => {
                    tracing::debug!(
                        path = %candidate.display(),
                        available = avail,
                        required = self.min_bytes,
                        "scratch volume below free-space floor"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "scratch volume stat failed");
                }
            }
        }
        let all = self
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ManagerError::ResourceExhausted(all))
    }
}
