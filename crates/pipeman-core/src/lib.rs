// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeman Core - Pipestance Lifecycle Manager
//!
//! This crate supervises many long-running pipeline executions
//! ("pipestances"): it invokes them on scratch storage, drives them tick
//! by tick through an opaque pipeline engine, migrates finished output to
//! permanent storage, archives failures, and persists its view of the
//! world to a JSON cache so a restart picks up where it left off.
//!
//! # Lifecycle
//!
//! ```text
//!              invoke                    engine
//! ┌─────────┐ ───────► ┌─────────┐ ─────────────► ┌──────────┐
//! │ (none)  │          │ pending │                │ running  │
//! └─────────┘          └─────────┘                └────┬─────┘
//!      ▲                    ▲                          │
//!      │ wipe               │ unfail            ┌──────┴──────┐
//!      │                    │                   ▼             ▼
//! ┌────┴─────┐         ┌────┴─────┐       ┌──────────┐  ┌──────────┐
//! │ (gone)   │ ◄────── │  failed  │ ◄──── │  failed  │  │ complete │
//! └──────────┘         └──────────┘       └──────────┘  └────┬─────┘
//!                                                            │ migrate
//!                                                            ▼
//!                                                      ┌──────────┐
//!                                                      │ copying  │──► complete
//!                                                      └──────────┘
//! ```
//!
//! `copying` is a transient overlay on `complete`: state queries report
//! it first so clients never assume output files are stable mid-copy.
//!
//! # On-disk layout
//!
//! Every pipestance is addressed through a `HEAD` symlink:
//!
//! ```text
//! <root>/<container>/<pipeline>/<psid>/HEAD
//!     -> <.../psid>/<version>            (aggregate path)
//!         -> <scratch>/<container>.<pipeline>.<psid>
//! ```
//!
//! Migration copies the scratch tree into a `.tmp` staging sibling, then
//! atomically swaps it into the aggregate path and removes the scratch
//! tree, collapsing the chain.
//!
//! # Configuration
//!
//! Loaded from `PIPEMAN_*` environment variables; see [`config::Config`].
//!
//! # Collaborators
//!
//! The pipeline engine, cluster job backend and mailer are injected as
//! trait objects ([`engine::PipelineEngine`], [`engine::JobBackend`],
//! [`notify::Mailer`]); the manager owns everything else.
//!
//! # Modules
//!
//! - [`cache`]: JSON snapshot of the lifecycle sets
//! - [`config`]: configuration from environment variables
//! - [`engine`]: pipeline engine and job backend interfaces
//! - [`error`]: error taxonomy of the operation surface
//! - [`failcoop`]: dated archive of failure diagnostics
//! - [`layout`]: pipestance path construction and symlink resolution
//! - [`manager`]: lifecycle operations and the per-tick processing pass
//! - [`migrate`]: scratch-to-permanent copy with crash resume
//! - [`notify`]: notifications and the mailer seam
//! - [`runtime`]: background process and clean loops
//! - [`scratch`]: round-robin scratch volume allocation
//! - [`state`]: pipestance keys and lifecycle state

#![deny(missing_docs)]

/// Durable JSON snapshot of the lifecycle sets.
pub mod cache;

/// Configuration loading from environment variables.
pub mod config;

/// Pipeline engine and cluster job backend interfaces.
pub mod engine;

/// Error types for manager operations.
pub mod error;

/// Dated archive of failure diagnostics (the fail coop).
pub mod failcoop;

/// Pipestance path construction and symlink-chain resolution.
pub mod layout;

/// Lifecycle operations and the per-tick processing pass.
pub mod manager;

/// Scratch-to-permanent migration with crash resume.
pub mod migrate;

/// Terminal-event notifications and the mailer seam.
pub mod notify;

/// Background driver for the process and clean loops.
pub mod runtime;

/// Round-robin scratch volume allocation.
pub mod scratch;

/// Pipestance identity and lifecycle state.
pub mod state;

pub use config::Config;
pub use error::{ManagerError, Result};
pub use manager::PipestanceManager;
pub use runtime::ManagerRuntime;
pub use state::{PipestanceKey, PipestanceState};
