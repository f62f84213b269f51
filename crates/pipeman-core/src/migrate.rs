// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scratch-to-permanent migration of a completed pipestance.
//!
//! The copy lands in a `.tmp` staging directory next to the aggregate
//! path, so readers following HEAD never observe a half-copied tree.
//! Only once every file is staged does [`migrate`] swap: drop the
//! aggregate symlink, rename the staging directory into place, delete
//! the scratch tree. The rename is the commit point.
//!
//! A crash at any earlier point leaves the symlink chain intact and the
//! staging directory partially filled; rerunning [`migrate`] resumes by
//! skipping files already staged with the expected size.
//!
//! Everything here is synchronous `std::fs` and is expected to run on a
//! blocking worker thread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// What a completed migration moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Regular files written into the staging tree this run.
    pub files_copied: u64,
    /// Bytes written into the staging tree this run.
    pub bytes_copied: u64,
}

/// Migration failure, tagged with the path being touched.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Filesystem operation failed.
    #[error("{op} {path}: {source}")]
    Io {
        /// Operation being attempted.
        op: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Scratch tree is gone and no staged copy exists to fall back on.
    #[error("scratch tree missing and no staged copy at {0}")]
    SourceMissing(PathBuf),
}

impl MigrateError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Staging directory used while copying `aggregate` off scratch.
pub fn staging_path(aggregate: &Path) -> PathBuf {
    let mut name = aggregate
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    aggregate.with_file_name(name)
}

/// Copy the scratch tree behind `link` into permanent storage and swap
/// the aggregate symlink for the real directory.
///
/// `link` is the aggregate path (currently a symlink), `scratch` the
/// directory it points at. Safe to rerun after a crash.
pub fn migrate(link: &Path, scratch: &Path) -> Result<MigrationOutcome, MigrateError> {
    let staging = staging_path(link);
    let mut outcome = MigrationOutcome::default();

    if scratch.exists() {
        copy_tree(scratch, &staging, &mut outcome)?;
    } else if !staging.exists() {
        return Err(MigrateError::SourceMissing(staging));
    } else {
        // Source wiped out from under an earlier staged copy. The stage
        // is all we have; promote it.
        debug!(staging = %staging.display(), "scratch gone, promoting staged copy");
    }

    swap(link, scratch, &staging)?;
    info!(
        path = %link.display(),
        files = outcome.files_copied,
        bytes = outcome.bytes_copied,
        "migration complete"
    );
    Ok(outcome)
}

fn swap(link: &Path, scratch: &Path, staging: &Path) -> Result<(), MigrateError> {
    match fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(MigrateError::io("unlink", link, e)),
    }
    fs::rename(staging, link).map_err(|e| MigrateError::io("rename", staging, e))?;
    if scratch.exists() {
        fs::remove_dir_all(scratch).map_err(|e| MigrateError::io("remove", scratch, e))?;
    }
    Ok(())
}

/// Mirror `src` into `dst`, skipping files already present with the
/// same length. Symlinks are recreated with their original targets.
fn copy_tree(src: &Path, dst: &Path, outcome: &mut MigrationOutcome) -> Result<(), MigrateError> {
    fs::create_dir_all(dst).map_err(|e| MigrateError::io("mkdir", dst, e))?;
    let entries = fs::read_dir(src).map_err(|e| MigrateError::io("readdir", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| MigrateError::io("readdir", src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&src_path)
            .map_err(|e| MigrateError::io("stat", &src_path, e))?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .map_err(|e| MigrateError::io("readlink", &src_path, e))?;
            match fs::symlink_metadata(&dst_path) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MigrateError::io("stat", &dst_path, e)),
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .map_err(|e| MigrateError::io("symlink", &dst_path, e))?;
        } else if meta.is_dir() {
            copy_tree(&src_path, &dst_path, outcome)?;
        } else {
            if let Ok(existing) = fs::metadata(&dst_path) {
                if existing.len() == meta.len() {
                    continue;
                }
            }
            let written = fs::copy(&src_path, &dst_path)
                .map_err(|e| MigrateError::io("copy", &src_path, e))?;
            outcome.files_copied += 1;
            outcome.bytes_copied += written;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Build the scratch tree plus the aggregate symlink pointing at it.
    fn setup(dir: &Path) -> (PathBuf, PathBuf) {
        let scratch = dir.join("scratch/fc1.PIPE_X.s1");
        let link = dir.join("perm/fc1/PIPE_X/s1/current");
        write(&scratch.join("_log"), "log line\n");
        write(&scratch.join("outs/summary.json"), "{}");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        symlink(&scratch, &link).unwrap();
        (link, scratch)
    }

    #[test]
    fn test_migrate_moves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (link, scratch) = setup(dir.path());

        let outcome = migrate(&link, &scratch).unwrap();
        assert_eq!(outcome.files_copied, 2);

        assert!(link.is_dir());
        assert!(!link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(link.join("_log")).unwrap(), "log line\n");
        assert!(link.join("outs/summary.json").is_file());
        assert!(!scratch.exists());
        assert!(!staging_path(&link).exists());
    }

    #[test]
    fn test_migrate_resumes_partial_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (link, scratch) = setup(dir.path());

        // Simulate a crash mid-copy: _log already staged at full size.
        let staging = staging_path(&link);
        write(&staging.join("_log"), "log line\n");

        let outcome = migrate(&link, &scratch).unwrap();
        // Only the file the first attempt never reached is recopied.
        assert_eq!(outcome.files_copied, 1);
        assert_eq!(fs::read_to_string(link.join("_log")).unwrap(), "log line\n");
    }

    #[test]
    fn test_migrate_recopies_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let (link, scratch) = setup(dir.path());

        let staging = staging_path(&link);
        write(&staging.join("_log"), "log");

        migrate(&link, &scratch).unwrap();
        assert_eq!(fs::read_to_string(link.join("_log")).unwrap(), "log line\n");
    }

    #[test]
    fn test_migrate_promotes_stage_when_scratch_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (link, scratch) = setup(dir.path());

        let staging = staging_path(&link);
        write(&staging.join("_log"), "log line\n");
        write(&staging.join("outs/summary.json"), "{}");
        fs::remove_dir_all(&scratch).unwrap();

        let outcome = migrate(&link, &scratch).unwrap();
        assert_eq!(outcome.files_copied, 0);
        assert!(link.is_dir());
        assert!(link.join("outs/summary.json").is_file());
    }

    #[test]
    fn test_migrate_errors_when_nothing_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("perm/current");
        let scratch = dir.path().join("scratch/gone");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        symlink(&scratch, &link).unwrap();

        assert!(matches!(
            migrate(&link, &scratch),
            Err(MigrateError::SourceMissing(_))
        ));
    }

    #[test]
    fn test_migrate_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let (link, scratch) = setup(dir.path());
        symlink("outs/summary.json", scratch.join("latest")).unwrap();

        migrate(&link, &scratch).unwrap();
        let copied = link.join("latest");
        assert!(copied.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&copied).unwrap(),
            PathBuf::from("outs/summary.json")
        );
    }
}
