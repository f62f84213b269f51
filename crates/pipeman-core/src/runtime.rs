// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-running driver for the manager's two periodic loops.
//!
//! [`ManagerRuntime::start`] loads persisted state, then spawns the
//! short-interval process loop and the long-interval scratch clean loop.
//! Both watch a shutdown channel and exit between ticks; [`shutdown`]
//! flips the channel and joins them. An in-flight tick is allowed to
//! finish so state transitions are never torn.
//!
//! [`shutdown`]: ManagerRuntime::shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::manager::PipestanceManager;

/// Owns the background loops of one [`PipestanceManager`].
pub struct ManagerRuntime {
    manager: Arc<PipestanceManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagerRuntime {
    /// Runtime for the given manager; call [`start`](Self::start) to run.
    pub fn new(manager: Arc<PipestanceManager>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// The supervised manager.
    pub fn manager(&self) -> &Arc<PipestanceManager> {
        &self.manager
    }

    /// Load state from disk and spawn the process and clean loops.
    pub async fn start(&mut self) -> Result<()> {
        self.manager.load().await?;

        let process_interval = self.manager.config().process_interval;
        let clean_interval = self.manager.config().clean_interval;
        info!(
            process_interval_ms = process_interval.as_millis() as u64,
            clean_interval_s = clean_interval.as_secs(),
            "starting pipestance manager loops"
        );

        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            process_loop(manager, shutdown, process_interval).await;
        }));

        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            clean_loop(manager, shutdown, clean_interval).await;
        }));
        Ok(())
    }

    /// Signal both loops to stop and wait for them to finish their
    /// current tick.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!("pipestance manager loops stopped");
    }
}

async fn process_loop(
    manager: Arc<PipestanceManager>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("process loop shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                manager.process_once().await;
            }
        }
    }
}

async fn clean_loop(
    manager: Arc<PipestanceManager>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick sweeps leftovers from before the restart.
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("clean loop shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                manager.clean_scratch_once().await;
            }
        }
    }
}
