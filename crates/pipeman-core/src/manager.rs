// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The pipestance manager: lifecycle operations and the per-tick
//! processing pass.
//!
//! All lifecycle sets live in one [`Registry`] behind a single mutex.
//! The lock is held for map operations only; engine calls, job backend
//! calls and filesystem work always happen outside it. Long-running work
//! (migration, fail archival, tree deletion) goes to background or
//! blocking tasks so a tick never waits on a copy.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheSnapshot, CacheStore};
use crate::config::Config;
use crate::engine::{
    jobs_already_gone, FatalError, InvokeRequest, JobBackend, PipelineEngine, PipestanceHandle,
    VdrKillReport,
};
use crate::error::{ManagerError, Result};
use crate::failcoop::FailCoop;
use crate::layout::{PipestanceLayout, PsLocation};
use crate::migrate;
use crate::notify::{AnalysisTrigger, Mailer, Notification};
use crate::scratch::ScratchAllocator;
use crate::state::{PipestanceKey, PipestanceState, Registry};

/// Supervises all pipestances of one manager instance.
///
/// Handed to [`ManagerRuntime`](crate::runtime::ManagerRuntime) to drive
/// the periodic loops; the lifecycle operations are safe to call from any
/// task concurrently with the loops.
pub struct PipestanceManager {
    config: Config,
    layout: PipestanceLayout,
    scratch: ScratchAllocator,
    cache: CacheStore,
    coop: FailCoop,
    engine: Arc<dyn PipelineEngine>,
    jobs: Arc<dyn JobBackend>,
    mailer: Arc<dyn Mailer>,
    registry: Mutex<Registry>,
    enabled: AtomicBool,
    refresh_permits: Arc<Semaphore>,
}

/// What one per-pipestance tick task decided.
enum TickOutcome {
    Complete {
        key: PipestanceKey,
        vdr: VdrKillReport,
    },
    Failed {
        key: PipestanceKey,
        fatal: FatalError,
    },
    Retried {
        key: PipestanceKey,
    },
    StillRunning {
        key: PipestanceKey,
    },
}

impl PipestanceManager {
    /// Manager probing real volume free space for scratch allocation.
    pub fn new(
        config: Config,
        engine: Arc<dyn PipelineEngine>,
        jobs: Arc<dyn JobBackend>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let scratch =
            ScratchAllocator::new(config.scratch_paths.clone(), config.min_scratch_bytes);
        Self::with_allocator(config, scratch, engine, jobs, mailer)
    }

    /// Manager with an explicit scratch allocator (custom free-space probe).
    pub fn with_allocator(
        config: Config,
        scratch: ScratchAllocator,
        engine: Arc<dyn PipelineEngine>,
        jobs: Arc<dyn JobBackend>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let layout = PipestanceLayout::new(
            config.pipestances_path.clone(),
            config.pipeline_version.clone(),
            config.scratch_paths.clone(),
        );
        let cache = CacheStore::new(config.cache_path.clone());
        let coop = FailCoop::new(config.fail_coop_path.clone(), config.instance_name.clone());
        let refresh_permits = Arc::new(Semaphore::new(config.max_concurrent_refreshes));
        Self {
            config,
            layout,
            scratch,
            cache,
            coop,
            engine,
            jobs,
            mailer,
            registry: Mutex::new(Registry::default()),
            enabled: AtomicBool::new(true),
            refresh_permits,
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn reg(&self) -> MutexGuard<'_, Registry> {
        // A poisoned lock means a panic while only mutating maps; the
        // maps are still structurally sound, so recover the guard.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_bootstrap(&self, pipeline: &str) -> bool {
        self.config.bootstrap_pipeline.as_deref() == Some(pipeline)
    }

    // ---- queries -------------------------------------------------------

    /// Lifecycle state of a pipestance, or `None` if unknown.
    pub fn state(&self, key: &PipestanceKey) -> Option<PipestanceState> {
        self.reg().state_of(key)
    }

    /// Number of pipestances currently in the running set.
    pub fn running_count(&self) -> usize {
        self.reg().running.len()
    }

    /// Resume per-tick processing.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Pause per-tick processing; lifecycle operations keep working.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether per-tick processing is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Swap out and return all queued notifications.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        std::mem::take(&mut self.reg().mail_queue)
    }

    /// Swap out and return all queued analysis triggers.
    pub fn drain_analysis_triggers(&self) -> Vec<AnalysisTrigger> {
        std::mem::take(&mut self.reg().analysis_queue)
    }

    /// Pipeline invocation source of a pipestance (`_invocation`).
    pub async fn invocation(&self, key: &PipestanceKey) -> Result<String> {
        self.read_metadata(key, "_invocation").await
    }

    /// Timestamp metadata of a pipestance (`_timestamp`).
    pub async fn timestamp(&self, key: &PipestanceKey) -> Result<String> {
        self.read_metadata(key, "_timestamp").await
    }

    /// Version metadata of a pipestance (`_versions`).
    pub async fn versions(&self, key: &PipestanceKey) -> Result<String> {
        self.read_metadata(key, "_versions").await
    }

    async fn read_metadata(&self, key: &PipestanceKey, name: &str) -> Result<String> {
        let path = self.layout.head_path(key).join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ManagerError::io(path, e))
    }

    // ---- lifecycle operations -----------------------------------------

    /// Invoke a new pipestance on scratch storage.
    ///
    /// Fails without side effects when the key already has state or no
    /// scratch volume qualifies. Returns once the engine has built the
    /// pipeline graph; the run loop takes over from there.
    pub async fn invoke(&self, key: PipestanceKey, src: String, tags: Vec<String>) -> Result<()> {
        if self.reg().state_of(&key).is_some() {
            return Err(ManagerError::AlreadyExists(key.to_string()));
        }
        let scratch_root = self.scratch.allocate()?;
        {
            let mut reg = self.reg();
            if reg.state_of(&key).is_some() {
                return Err(ManagerError::AlreadyExists(key.to_string()));
            }
            reg.pending.insert(key.clone());
        }

        match self.setup_and_invoke(&key, &scratch_root, src, tags).await {
            Ok(handle) => {
                {
                    let mut reg = self.reg();
                    reg.pending.remove(&key);
                    reg.retries_remaining
                        .insert(key.clone(), self.config.default_retries);
                    reg.running.insert(key.clone(), handle);
                }
                info!(pipestance = %key, scratch = %scratch_root.display(), "invoked");
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                self.reg().remove_pending(&key, false);
                Err(e)
            }
        }
    }

    /// Lay down the symlink chain and hand the invocation to the engine.
    async fn setup_and_invoke(
        &self,
        key: &PipestanceKey,
        scratch_root: &std::path::Path,
        src: String,
        tags: Vec<String>,
    ) -> Result<Arc<dyn PipestanceHandle>> {
        let scratch_ps = self.layout.scratch_ps_path(scratch_root, key);
        let ps_dir = self.layout.ps_dir(key);
        let aggregate = self.layout.aggregate_path(key);
        let head = self.layout.head_path(key);

        tokio::fs::create_dir_all(&scratch_ps)
            .await
            .map_err(|e| ManagerError::io(scratch_ps.clone(), e))?;
        tokio::fs::create_dir_all(&ps_dir)
            .await
            .map_err(|e| ManagerError::io(ps_dir.clone(), e))?;
        tokio::fs::symlink(&scratch_ps, &aggregate)
            .await
            .map_err(|e| ManagerError::io(aggregate.clone(), e))?;
        tokio::fs::symlink(&aggregate, &head)
            .await
            .map_err(|e| ManagerError::io(head.clone(), e))?;

        let req = InvokeRequest {
            src,
            psid: key.psid.clone(),
            path: aggregate.clone(),
            tags,
        };
        match self.engine.invoke(req).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // The pipestance never existed; roll the chain back.
                let _ = tokio::fs::remove_file(&head).await;
                let _ = tokio::fs::remove_file(&aggregate).await;
                let _ = tokio::fs::remove_dir_all(&scratch_ps).await;
                Err(e.into())
            }
        }
    }

    /// Kill a running pipestance, cancelling its backend jobs.
    ///
    /// A job backend answer of "does not exist" means the jobs finished
    /// naturally in the meantime; the kill still succeeds.
    pub async fn kill(&self, key: &PipestanceKey) -> Result<()> {
        let handle = {
            let mut reg = self.reg();
            let Some(handle) = reg.running.get(key).cloned() else {
                return Err(ManagerError::NotRunning(key.to_string()));
            };
            reg.pending.insert(key.clone());
            handle
        };

        match self.jobs.cancel_jobs(&key.fqname()).await {
            Ok(_) => {}
            Err(output) if jobs_already_gone(&output) => {
                debug!(pipestance = %key, "backend jobs already finished");
            }
            Err(output) => {
                self.reg().remove_pending(key, false);
                return Err(ManagerError::JobBackend(output));
            }
        }

        handle.kill().await;
        handle.unlock();
        {
            let mut reg = self.reg();
            reg.running.remove(key);
            reg.retries_remaining.remove(key);
            reg.failed.insert(key.clone());
            reg.pending.remove(key);
        }
        info!(pipestance = %key, "killed");
        self.persist().await;
        Ok(())
    }

    /// Put a failed pipestance back into the running set.
    ///
    /// Rejects `copying` with a dedicated error so callers know to retry
    /// later. Any failure during reset restores the failed flag.
    pub async fn unfail(&self, key: &PipestanceKey) -> Result<()> {
        {
            let mut reg = self.reg();
            match reg.state_of(key) {
                Some(PipestanceState::Failed) => {}
                Some(PipestanceState::Copying) => {
                    return Err(ManagerError::Copying(key.to_string()))
                }
                None => return Err(ManagerError::NotExists(key.to_string())),
                Some(_) => return Err(ManagerError::NotFailed(key.to_string())),
            }
            reg.failed.remove(key);
            reg.pending.insert(key.clone());
        }

        match self.reset_failed(key).await {
            Ok(handle) => {
                {
                    let mut reg = self.reg();
                    reg.pending.remove(key);
                    reg.retries_remaining
                        .insert(key.clone(), self.config.default_retries);
                    reg.running.insert(key.clone(), handle);
                }
                info!(pipestance = %key, "unfailed");
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                self.reg().remove_pending(key, true);
                Err(e)
            }
        }
    }

    async fn reset_failed(&self, key: &PipestanceKey) -> Result<Arc<dyn PipestanceHandle>> {
        let handle = self
            .engine
            .reattach(&key.psid, &self.layout.aggregate_path(key))
            .await?;
        for fqname in handle.failed_stage_fqnames() {
            match self.jobs.cancel_jobs(&fqname).await {
                Ok(_) => {}
                Err(output) if jobs_already_gone(&output) => {}
                Err(output) => {
                    warn!(stage = %fqname, output = %output, "could not cancel jobs before reset");
                }
            }
        }
        handle.reset().await?;
        Ok(handle)
    }

    /// Delete a failed pipestance from scratch storage entirely.
    ///
    /// Refuses unless the resolved data directory sits under a configured
    /// scratch root, so migrated data can never be wiped this way.
    pub async fn wipe(&self, key: &PipestanceKey) -> Result<()> {
        {
            let mut reg = self.reg();
            match reg.state_of(key) {
                Some(PipestanceState::Failed) => {}
                Some(PipestanceState::Copying) => {
                    return Err(ManagerError::Copying(key.to_string()))
                }
                None => return Err(ManagerError::NotExists(key.to_string())),
                Some(_) => return Err(ManagerError::NotFailed(key.to_string())),
            }
            reg.failed.remove(key);
            reg.pending.insert(key.clone());
        }

        let head = self.layout.head_path(key);
        let target = match self.layout.resolve(key) {
            Ok(PsLocation::Scratch { target, .. }) if self.layout.is_on_scratch(&target) => target,
            Ok(_) => {
                self.reg().remove_pending(key, true);
                return Err(ManagerError::WipeRefused(key.to_string()));
            }
            Err(e) => {
                self.reg().remove_pending(key, true);
                return Err(ManagerError::io(head, e));
            }
        };

        let aggregate = self.layout.aggregate_path(key);
        let ps_dir = self.layout.ps_dir(key);
        let head_for_err = head.clone();
        let removal = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::remove_file(&head)?;
            std::fs::remove_file(&aggregate)?;
            std::fs::remove_dir_all(&target)?;
            // Drop the psid directory too if nothing else lives there.
            let _ = std::fs::remove_dir(&ps_dir);
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r);

        match removal {
            Ok(()) => {
                {
                    let mut reg = self.reg();
                    reg.remove_pending(key, false);
                    reg.retries_remaining.remove(key);
                }
                info!(pipestance = %key, "wiped from scratch");
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                self.reg().remove_pending(key, true);
                Err(ManagerError::io(head_for_err, e))
            }
        }
    }

    /// Hide a completed pipestance from listings by deleting its HEAD
    /// symlink and dropping the completed flag. The data stays.
    pub async fn archive_head(&self, key: &PipestanceKey) -> Result<()> {
        {
            let mut reg = self.reg();
            match reg.state_of(key) {
                Some(PipestanceState::Complete) => {}
                Some(PipestanceState::Copying) => {
                    return Err(ManagerError::Copying(key.to_string()))
                }
                _ => return Err(ManagerError::NotExists(key.to_string())),
            }
            reg.completed.remove(key);
            reg.pending.insert(key.clone());
        }

        let head = self.layout.head_path(key);
        match tokio::fs::remove_file(&head).await {
            Ok(()) => {
                self.reg().remove_pending(key, false);
                info!(pipestance = %key, "archived HEAD");
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                let mut reg = self.reg();
                reg.pending.remove(key);
                reg.completed.insert(key.clone());
                drop(reg);
                Err(ManagerError::io(head, e))
            }
        }
    }

    // ---- startup -------------------------------------------------------

    /// Load state from the cache file and the on-disk pipestance tree.
    ///
    /// A missing or unparsable cache is downgraded to a warning; every
    /// discovered pipestance is then classified from disk alone. Keys the
    /// cache knew as running are reattached through the engine; a reattach
    /// failure classifies the pipestance as failed rather than leaving it
    /// unresolved. Interrupted migrations are resumed.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        let snapshot = match self.cache.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.cache.path().display(), error = %e,
                    "state cache unreadable, re-inventorying from disk");
                CacheSnapshot::default()
            }
        };

        let keys = self.inventory().await?;
        info!(count = keys.len(), "inventoried pipestances");

        let mut to_migrate = Vec::new();
        for key in keys {
            self.repair_interrupted_commit(&key);
            if snapshot.completed.contains(&key) || snapshot.copying.contains(&key) {
                self.reg().completed.insert(key.clone());
                if matches!(self.layout.resolve(&key), Ok(PsLocation::Scratch { .. })) {
                    to_migrate.push(key);
                }
            } else if snapshot.failed.contains(&key) {
                self.reg().failed.insert(key);
            } else if self.has_finalstate(&key).await {
                // Completed without needing an engine reattach.
                self.reg().completed.insert(key.clone());
                if matches!(self.layout.resolve(&key), Ok(PsLocation::Scratch { .. })) {
                    to_migrate.push(key);
                }
            } else {
                let path = self.layout.aggregate_path(&key);
                match self.engine.reattach(&key.psid, &path).await {
                    Ok(handle) => {
                        let mut reg = self.reg();
                        reg.retries_remaining
                            .insert(key.clone(), self.config.default_retries);
                        reg.running.insert(key, handle);
                    }
                    Err(e) => {
                        warn!(pipestance = %key, error = %e,
                            "reattach failed, classifying as failed");
                        self.reg().failed.insert(key);
                    }
                }
            }
        }

        for key in to_migrate {
            self.spawn_migration(&key);
        }
        self.persist().await;
        Ok(())
    }

    /// Finish a migration commit interrupted between unlink and rename.
    ///
    /// A missing aggregate path next to a staged `.tmp` sibling means the
    /// old symlink was removed but the staged copy never took its place;
    /// the stage is complete (the swap only starts after a full copy), so
    /// rename it in and drop any scratch leftover.
    fn repair_interrupted_commit(&self, key: &PipestanceKey) {
        let aggregate = self.layout.aggregate_path(key);
        if aggregate.symlink_metadata().is_ok() {
            return;
        }
        let staging = migrate::staging_path(&aggregate);
        if !staging.is_dir() {
            return;
        }
        match std::fs::rename(&staging, &aggregate) {
            Ok(()) => {
                info!(pipestance = %key,
                    "promoted staged copy left by an interrupted migration");
                for root in self.scratch.paths() {
                    let leftover = self.layout.scratch_ps_path(root, key);
                    if leftover.exists() {
                        if let Err(e) = std::fs::remove_dir_all(&leftover) {
                            warn!(path = %leftover.display(), error = %e,
                                "could not remove migrated scratch leftover");
                        }
                    }
                }
            }
            Err(e) => warn!(pipestance = %key, error = %e,
                "could not promote staged copy"),
        }
    }

    async fn has_finalstate(&self, key: &PipestanceKey) -> bool {
        tokio::fs::try_exists(self.layout.head_path(key).join("_finalstate"))
            .await
            .unwrap_or(false)
    }

    /// Walk `<root>/<container>/<pipeline>/<psid>` for directories with a
    /// HEAD symlink. Only known pipeline names are descended into.
    async fn inventory(&self) -> Result<Vec<PipestanceKey>> {
        let root = self.layout.root().to_path_buf();
        let pipelines = self.engine.pipeline_names();
        let mut keys = Vec::new();

        let mut containers = match tokio::fs::read_dir(&root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(ManagerError::io(root, e)),
        };
        while let Ok(Some(container)) = containers.next_entry().await {
            let Some(container_name) = container.file_name().to_str().map(String::from) else {
                continue;
            };
            for pipeline in &pipelines {
                let pipeline_dir = container.path().join(pipeline);
                let mut psids = match tokio::fs::read_dir(&pipeline_dir).await {
                    Ok(dir) => dir,
                    Err(_) => continue,
                };
                while let Ok(Some(psid)) = psids.next_entry().await {
                    let Some(psid_name) = psid.file_name().to_str().map(String::from) else {
                        continue;
                    };
                    let key = PipestanceKey::new(&container_name, pipeline, psid_name);
                    if self.layout.head_path(&key).symlink_metadata().is_ok() {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    // ---- run loop passes ----------------------------------------------

    /// One processing round over the running set.
    ///
    /// Snapshots the running map, fans out one task per pipestance
    /// (bounded by the refresh permit pool), joins them all, applies the
    /// transitions under the lock and rewrites the cache.
    pub async fn process_once(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let batch: Vec<(PipestanceKey, Arc<dyn PipestanceHandle>, bool)> = {
            let reg = self.reg();
            reg.running
                .iter()
                .map(|(key, handle)| {
                    let retries = reg.retries_remaining.get(key).copied().unwrap_or(0);
                    (key.clone(), Arc::clone(handle), retries > 0)
                })
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (key, handle, allow_retry) in batch {
            let Ok(permit) = Arc::clone(&self.refresh_permits).acquire_owned().await else {
                break;
            };
            let jobs = Arc::clone(&self.jobs);
            let coop = self.coop.clone();
            let head = self.layout.head_path(&key);
            tasks.spawn(async move {
                let outcome = process_one(key, handle, jobs, coop, head, allow_retry).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "pipestance task panicked"),
            }
        }

        let mut to_migrate = Vec::new();
        let mut immediate = Vec::new();
        {
            let mut reg = self.reg();
            for outcome in outcomes {
                match outcome {
                    TickOutcome::Complete { key, vdr } => {
                        if reg.running.remove(&key).is_none() {
                            // Killed (or otherwise taken) mid-tick; the
                            // outcome is stale, drop it.
                            debug!(pipestance = %key, "dropping stale tick outcome");
                            continue;
                        }
                        reg.retries_remaining.remove(&key);
                        reg.completed.insert(key.clone());
                        info!(pipestance = %key, vdr_bytes = vdr.size, vdr_files = vdr.count,
                            "complete");
                        let note = Notification::Complete {
                            key: key.clone(),
                            vdr_bytes: vdr.size,
                            vdr_files: vdr.count,
                        };
                        if self.is_bootstrap(&key.pipeline) {
                            immediate.push(note);
                        } else {
                            reg.mail_queue.push(note);
                        }
                        to_migrate.push(key);
                    }
                    TickOutcome::Failed { key, fatal } => {
                        if reg.running.remove(&key).is_none() {
                            debug!(pipestance = %key, "dropping stale tick outcome");
                            continue;
                        }
                        reg.retries_remaining.remove(&key);
                        reg.failed.insert(key.clone());
                        info!(pipestance = %key, stage = %fatal.stage, "failed");
                        let note = Notification::Failed {
                            key: key.clone(),
                            stage: fatal.stage,
                            summary: fatal.summary,
                        };
                        if self.is_bootstrap(&key.pipeline) {
                            immediate.push(note);
                        } else {
                            reg.mail_queue.push(note);
                        }
                    }
                    TickOutcome::Retried { key } => {
                        if let Some(retries) = reg.retries_remaining.get_mut(&key) {
                            *retries = retries.saturating_sub(1);
                        }
                        info!(pipestance = %key, "retrying after transient failure");
                    }
                    TickOutcome::StillRunning { key } => {
                        trace!(pipestance = %key, "still running");
                    }
                }
            }
        }

        for note in immediate {
            self.mailer.send_immediate(&note);
        }
        for key in to_migrate {
            self.spawn_migration(&key);
        }
        self.persist().await;
    }

    /// Kick off (or join) the scratch-to-permanent migration of `key`.
    ///
    /// The copying set is the dedupe: a key already mid-copy is left
    /// alone. The copy itself runs detached so ticks never wait on it.
    pub fn spawn_migration(self: &Arc<Self>, key: &PipestanceKey) {
        {
            let mut reg = self.reg();
            if !reg.copying.insert(key.clone()) {
                return;
            }
        }
        let manager = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            manager.run_migration(key).await;
        });
    }

    async fn run_migration(&self, key: PipestanceKey) {
        let location = match self.layout.resolve(&key) {
            Ok(location) => location,
            Err(e) => {
                warn!(pipestance = %key, error = %e, "cannot resolve path for migration");
                self.reg().copying.remove(&key);
                self.persist().await;
                return;
            }
        };
        let (link, target) = match location {
            PsLocation::Migrated(_) => {
                self.reg().copying.remove(&key);
                self.persist().await;
                return;
            }
            PsLocation::Scratch { link, target } => (link, target),
        };

        let link_for_report = link.clone();
        let result = tokio::task::spawn_blocking(move || migrate::migrate(&link, &target))
            .await
            .map_err(|e| migrate::MigrateError::Io {
                op: "migrate",
                path: link_for_report.clone(),
                source: std::io::Error::other(e),
            })
            .and_then(|r| r);

        match result {
            Ok(_) => {
                {
                    let mut reg = self.reg();
                    reg.copying.remove(&key);
                    if self.is_bootstrap(&key.pipeline) {
                        reg.analysis_queue.push(AnalysisTrigger {
                            container: key.container.clone(),
                        });
                    }
                }
                self.persist().await;
            }
            Err(e) => {
                // Source data is untouched; alert and leave the staging
                // directory for diagnosis.
                warn!(pipestance = %key, error = %e, "migration failed");
                self.reg().copying.remove(&key);
                let note = Notification::MigrationFailed {
                    key: key.clone(),
                    path: link_for_report,
                    error: e.to_string(),
                };
                self.mailer.send_immediate(&note);
                self.persist().await;
            }
        }
    }

    /// One sweep of the clean loop: wipe stale scratch directories whose
    /// pipestance is failed or unknown. Errors are logged, never fatal.
    pub async fn clean_scratch_once(&self) {
        for root in &self.config.scratch_paths {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "cannot scan scratch volume");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %root.display(), error = %e, "scratch scan aborted");
                        break;
                    }
                };
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(key) = name.parse::<PipestanceKey>() else {
                    debug!(path = %entry.path().display(), "ignoring non-pipestance entry");
                    continue;
                };
                let age = entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|m| m.elapsed().ok());
                let Some(age) = age else { continue };
                if age < self.config.scratch_expiration {
                    continue;
                }

                match self.state(&key) {
                    Some(PipestanceState::Failed) => {
                        match self.wipe(&key).await {
                            Ok(()) => info!(pipestance = %key, "wiped stale failed pipestance"),
                            Err(e) => {
                                warn!(pipestance = %key, error = %e, "stale wipe failed")
                            }
                        }
                    }
                    None => {
                        let path = entry.path();
                        let removal =
                            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
                                .await;
                        match removal {
                            Ok(Ok(())) => {
                                info!(pipestance = %key, "removed orphaned scratch directory")
                            }
                            Ok(Err(e)) => {
                                warn!(pipestance = %key, error = %e, "orphan removal failed")
                            }
                            Err(e) => warn!(pipestance = %key, error = %e, "orphan removal failed"),
                        }
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Snapshot the lifecycle sets and rewrite the cache file.
    ///
    /// Pending keys are persisted as running so a restart reattaches
    /// them. Write failures are logged; the in-memory state stays
    /// authoritative until the next round's write.
    async fn persist(&self) {
        let snapshot = {
            let reg = self.reg();
            let mut running: BTreeSet<PipestanceKey> = reg.running.keys().cloned().collect();
            running.extend(reg.pending.iter().cloned());
            CacheSnapshot {
                completed: reg.completed.clone(),
                failed: reg.failed.clone(),
                copying: reg.copying.clone(),
                running,
            }
        };
        if let Err(e) = self.cache.store(&snapshot).await {
            warn!(path = %self.cache.path().display(), error = %e,
                "failed to write state cache");
        }
    }
}

/// Per-pipestance work of one tick, run concurrently with its peers.
/// Touches only the engine, job backend and filesystem; state moves are
/// applied by the caller after the barrier.
async fn process_one(
    key: PipestanceKey,
    handle: Arc<dyn PipestanceHandle>,
    jobs: Arc<dyn JobBackend>,
    coop: FailCoop,
    head: PathBuf,
    allow_retry: bool,
) -> TickOutcome {
    if let Err(e) = handle.refresh_state().await {
        warn!(pipestance = %key, error = %e, "state refresh failed, will retry next tick");
        return TickOutcome::StillRunning { key };
    }
    match handle.state().as_str() {
        "complete" => {
            let vdr = handle.vdr_kill().await;
            handle.post_process().await;
            handle.unlock();
            TickOutcome::Complete { key, vdr }
        }
        "failed" => {
            if allow_retry && handle.error_is_transient() {
                cancel_failed_stage_jobs(&key, handle.as_ref(), jobs.as_ref()).await;
                match handle.reset().await {
                    Ok(()) => return TickOutcome::Retried { key },
                    Err(e) => {
                        warn!(pipestance = %key, error = %e, "transient-failure reset failed");
                    }
                }
            }
            handle.unlock();
            let fatal = handle.fatal_error();
            cancel_failed_stage_jobs(&key, handle.as_ref(), jobs.as_ref()).await;
            archive_failure(&key, &coop, &fatal, &head).await;
            TickOutcome::Failed { key, fatal }
        }
        _ => {
            handle.check_heartbeats().await;
            handle.step_nodes().await;
            TickOutcome::StillRunning { key }
        }
    }
}

async fn cancel_failed_stage_jobs(
    key: &PipestanceKey,
    handle: &dyn PipestanceHandle,
    jobs: &dyn JobBackend,
) {
    for fqname in handle.failed_stage_fqnames() {
        match jobs.cancel_jobs(&fqname).await {
            Ok(_) => {}
            Err(output) if jobs_already_gone(&output) => {}
            Err(output) => {
                warn!(pipestance = %key, stage = %fqname, output = %output,
                    "could not cancel failed-stage jobs");
            }
        }
    }
}

/// Write the fail-coop record for one failure. Best effort; archival
/// problems never block the failed transition.
async fn archive_failure(key: &PipestanceKey, coop: &FailCoop, fatal: &FatalError, head: &PathBuf) {
    let invocation = tokio::fs::read_to_string(head.join("_invocation"))
        .await
        .unwrap_or_default();
    let coop = coop.clone();
    let key_owned = key.clone();
    let fatal = fatal.clone();
    let archived =
        tokio::task::spawn_blocking(move || coop.archive(&key_owned, &fatal, &invocation)).await;
    match archived {
        Ok(Ok(dir)) => debug!(pipestance = %key, dir = %dir.display(), "failure archived"),
        Ok(Err(e)) => warn!(pipestance = %key, error = %e, "failure archival failed"),
        Err(e) => warn!(pipestance = %key, error = %e, "failure archival failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::StaticHandle;
    use crate::engine::EngineError;
    use crate::scratch::FreeSpace;
    use async_trait::async_trait;
    use std::path::Path;

    struct NullEngine;

    #[async_trait]
    impl PipelineEngine for NullEngine {
        fn pipeline_names(&self) -> Vec<String> {
            vec!["PIPE_X".to_string()]
        }
        async fn invoke(
            &self,
            _req: InvokeRequest,
        ) -> std::result::Result<Arc<dyn PipestanceHandle>, EngineError> {
            Ok(Arc::new(StaticHandle::new("running")))
        }
        async fn reattach(
            &self,
            _psid: &str,
            _path: &Path,
        ) -> std::result::Result<Arc<dyn PipestanceHandle>, EngineError> {
            Ok(Arc::new(StaticHandle::new("running")))
        }
    }

    struct NullJobs;

    #[async_trait]
    impl JobBackend for NullJobs {
        async fn cancel_jobs(&self, _pattern: &str) -> std::result::Result<String, String> {
            Ok(String::new())
        }
    }

    struct PlentySpace;

    impl FreeSpace for PlentySpace {
        fn bytes_available(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    fn manager(dir: &Path) -> Arc<PipestanceManager> {
        let scratch_root = dir.join("scratch0");
        std::fs::create_dir_all(&scratch_root).unwrap();
        let config = Config::with_roots(
            dir.join("pipestances"),
            vec![scratch_root.clone()],
            dir.join("cache/pipestances"),
            dir.join("failcoop"),
        );
        let allocator = ScratchAllocator::with_probe(
            vec![scratch_root],
            config.min_scratch_bytes,
            Box::new(PlentySpace),
        );
        Arc::new(PipestanceManager::with_allocator(
            config,
            allocator,
            Arc::new(NullEngine),
            Arc::new(NullJobs),
            Arc::new(crate::notify::LogMailer),
        ))
    }

    fn key() -> PipestanceKey {
        PipestanceKey::new("fc1", "PIPE_X", "s1")
    }

    #[tokio::test]
    async fn test_invoke_sets_up_chain_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager
            .invoke(key(), "call PIPE_X()".into(), vec![])
            .await
            .unwrap();

        assert_eq!(
            manager.state(&key()),
            Some(PipestanceState::Running("running".into()))
        );
        assert_eq!(manager.running_count(), 1);
        // HEAD resolves through the aggregate symlink to scratch.
        let layout = PipestanceLayout::new(
            dir.path().join("pipestances"),
            "current",
            vec![dir.path().join("scratch0")],
        );
        match layout.resolve(&key()).unwrap() {
            PsLocation::Scratch { target, .. } => assert!(target.is_dir()),
            other => panic!("expected scratch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_rejects_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();

        let err = manager.invoke(key(), "src".into(), vec![]).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_kill_moves_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();

        manager.kill(&key()).await.unwrap();
        assert_eq!(manager.state(&key()), Some(PipestanceState::Failed));
        assert_eq!(manager.running_count(), 0);

        // Second kill: no longer running.
        let err = manager.kill(&key()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_unfail_requires_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();

        let err = manager.unfail(&key()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFailed(_)));

        let missing = PipestanceKey::new("fc9", "PIPE_X", "nope");
        let err = manager.unfail(&missing).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotExists(_)));
    }

    #[tokio::test]
    async fn test_unfail_returns_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();
        manager.kill(&key()).await.unwrap();

        manager.unfail(&key()).await.unwrap();
        assert_eq!(
            manager.state(&key()),
            Some(PipestanceState::Running("running".into()))
        );
    }

    #[tokio::test]
    async fn test_unfail_rejects_copying() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        {
            let mut reg = manager.reg();
            reg.completed.insert(key());
            reg.copying.insert(key());
        }
        let err = manager.unfail(&key()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Copying(_)));
    }

    #[tokio::test]
    async fn test_wipe_removes_scratch_pipestance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();
        manager.kill(&key()).await.unwrap();

        manager.wipe(&key()).await.unwrap();
        assert_eq!(manager.state(&key()), None);
        assert!(!dir
            .path()
            .join("scratch0/fc1.PIPE_X.s1")
            .exists());
    }

    #[tokio::test]
    async fn test_wipe_refuses_migrated_data() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let key = key();

        // Aggregate path is a plain directory: already migrated.
        let ps_dir = dir.path().join("pipestances/fc1/PIPE_X/s1");
        std::fs::create_dir_all(ps_dir.join("current")).unwrap();
        std::os::unix::fs::symlink(ps_dir.join("current"), ps_dir.join("HEAD")).unwrap();
        manager.reg().failed.insert(key.clone());

        let err = manager.wipe(&key).await.unwrap_err();
        assert!(matches!(err, ManagerError::WipeRefused(_)));
        // The failed flag is restored, nothing deleted.
        assert_eq!(manager.state(&key), Some(PipestanceState::Failed));
        assert!(ps_dir.join("current").is_dir());
    }

    #[tokio::test]
    async fn test_archive_head_hides_completed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let key = key();

        let ps_dir = dir.path().join("pipestances/fc1/PIPE_X/s1");
        std::fs::create_dir_all(ps_dir.join("current")).unwrap();
        std::os::unix::fs::symlink(ps_dir.join("current"), ps_dir.join("HEAD")).unwrap();
        manager.reg().completed.insert(key.clone());

        manager.archive_head(&key).await.unwrap();
        assert_eq!(manager.state(&key), None);
        assert!(!ps_dir.join("HEAD").symlink_metadata().is_ok());
        // Data untouched.
        assert!(ps_dir.join("current").is_dir());

        let err = manager.archive_head(&key).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotExists(_)));
    }

    #[tokio::test]
    async fn test_drains_swap_out() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.reg().mail_queue.push(Notification::Failed {
            key: key(),
            stage: "ST".into(),
            summary: "s".into(),
        });
        manager
            .reg()
            .analysis_queue
            .push(AnalysisTrigger { container: "fc1".into() });

        assert_eq!(manager.drain_notifications().len(), 1);
        assert!(manager.drain_notifications().is_empty());
        assert_eq!(manager.drain_analysis_triggers().len(), 1);
        assert!(manager.drain_analysis_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_getters_read_through_head() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();

        let scratch_ps = dir.path().join("scratch0/fc1.PIPE_X.s1");
        std::fs::write(scratch_ps.join("_invocation"), "call PIPE_X()").unwrap();
        assert_eq!(
            manager.invocation(&key()).await.unwrap(),
            "call PIPE_X()"
        );
        assert!(manager.timestamp(&key()).await.is_err());
    }

    #[tokio::test]
    async fn test_disable_pauses_processing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.is_enabled());
        manager.disable();
        assert!(!manager.is_enabled());
        // A disabled tick leaves the running set alone.
        manager.invoke(key(), "src".into(), vec![]).await.unwrap();
        manager.process_once().await;
        assert_eq!(manager.running_count(), 1);
        manager.enable();
        assert!(manager.is_enabled());
    }
}
