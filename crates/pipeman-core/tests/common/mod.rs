// Copyright (C) 2025 Pipeman Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;

use pipeman_core::config::Config;
use pipeman_core::engine::{
    EngineError, FatalError, InvokeRequest, JobBackend, PipelineEngine, PipestanceHandle,
    VdrKillReport,
};
use pipeman_core::manager::PipestanceManager;
use pipeman_core::notify::{Mailer, Notification};
use pipeman_core::scratch::{FreeSpace, ScratchAllocator};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Two-way rendezvous for interleaving test work with a refresh in
/// flight: a gated handle parks inside `refresh_state` until released.
pub struct RefreshGate {
    entered: tokio::sync::Semaphore,
    release: tokio::sync::Semaphore,
}

impl RefreshGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: tokio::sync::Semaphore::new(0),
            release: tokio::sync::Semaphore::new(0),
        })
    }

    /// Wait until a gated refresh has started.
    pub async fn wait_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    /// Let the parked refresh proceed.
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

/// Handle whose `refresh_state` walks a scripted sequence of states.
/// Once the script runs out, the last state sticks.
pub struct ScriptedHandle {
    script: Mutex<VecDeque<String>>,
    current: Mutex<String>,
    fatal: FatalError,
    transient: bool,
    refresh_gate: Mutex<Option<Arc<RefreshGate>>>,
    pub resets: AtomicUsize,
    pub kills: AtomicUsize,
    pub unlocks: AtomicUsize,
    pub steps: AtomicUsize,
}

impl ScriptedHandle {
    pub fn new(states: &[&str]) -> Self {
        Self::with_failure(states, FatalError::default(), false)
    }

    pub fn with_failure(states: &[&str], fatal: FatalError, transient: bool) -> Self {
        Self {
            script: Mutex::new(states.iter().map(|s| s.to_string()).collect()),
            current: Mutex::new("running".to_string()),
            fatal,
            transient,
            refresh_gate: Mutex::new(None),
            resets: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
        }
    }

    /// Park the next `refresh_state` call on `gate` until released.
    pub fn gate_refresh(&self, gate: &Arc<RefreshGate>) {
        *self.refresh_gate.lock().unwrap() = Some(Arc::clone(gate));
    }
}

#[async_trait]
impl PipestanceHandle for ScriptedHandle {
    async fn refresh_state(&self) -> Result<(), EngineError> {
        let gate = self.refresh_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.add_permits(1);
            gate.release.acquire().await.unwrap().forget();
        }
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *self.current.lock().unwrap() = next;
        }
        Ok(())
    }

    fn state(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    async fn step_nodes(&self) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }

    async fn check_heartbeats(&self) {}

    async fn vdr_kill(&self) -> VdrKillReport {
        VdrKillReport { count: 3, size: 4096 }
    }

    async fn post_process(&self) {}

    async fn reset(&self) -> Result<(), EngineError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = "running".to_string();
        Ok(())
    }

    fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn fatal_error(&self) -> FatalError {
        self.fatal.clone()
    }

    fn failed_stage_fqnames(&self) -> Vec<String> {
        if self.fatal.stage.is_empty() {
            Vec::new()
        } else {
            vec![self.fatal.stage.clone()]
        }
    }

    fn error_is_transient(&self) -> bool {
        self.transient
    }
}

/// Per-psid script for the mock engine.
pub struct Script {
    pub states: Vec<String>,
    pub fatal: FatalError,
    pub transient: bool,
}

impl Script {
    pub fn states(states: &[&str]) -> Self {
        Self {
            states: states.iter().map(|s| s.to_string()).collect(),
            fatal: FatalError::default(),
            transient: false,
        }
    }

    pub fn failing(states: &[&str], stage: &str, transient: bool) -> Self {
        Self {
            states: states.iter().map(|s| s.to_string()).collect(),
            fatal: FatalError {
                stage: stage.to_string(),
                preflight: false,
                summary: format!("stage {stage} failed"),
                errlog: "boom".to_string(),
                kind: "errors".to_string(),
                paths: Vec::new(),
            },
            transient,
        }
    }

    fn build(&self) -> ScriptedHandle {
        let states: Vec<&str> = self.states.iter().map(String::as_str).collect();
        ScriptedHandle::with_failure(&states, self.fatal.clone(), self.transient)
    }
}

/// Engine serving scripted handles and writing a small pipestance tree
/// through the aggregate path on invoke (so migration has files to move).
pub struct MockEngine {
    invoke_scripts: Mutex<HashMap<String, Script>>,
    reattach_scripts: Mutex<HashMap<String, Script>>,
    pub fail_reattach: Mutex<HashSet<String>>,
    pub handles: Mutex<HashMap<String, Arc<ScriptedHandle>>>,
    pub reattached: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            invoke_scripts: Mutex::new(HashMap::new()),
            reattach_scripts: Mutex::new(HashMap::new()),
            fail_reattach: Mutex::new(HashSet::new()),
            handles: Mutex::new(HashMap::new()),
            reattached: Mutex::new(Vec::new()),
        }
    }

    pub fn script_invoke(&self, psid: &str, script: Script) {
        self.invoke_scripts
            .lock()
            .unwrap()
            .insert(psid.to_string(), script);
    }

    pub fn script_reattach(&self, psid: &str, script: Script) {
        self.reattach_scripts
            .lock()
            .unwrap()
            .insert(psid.to_string(), script);
    }

    pub fn handle(&self, psid: &str) -> Arc<ScriptedHandle> {
        Arc::clone(self.handles.lock().unwrap().get(psid).unwrap())
    }
}

#[async_trait]
impl PipelineEngine for MockEngine {
    fn pipeline_names(&self) -> Vec<String> {
        vec!["PIPE_X".to_string(), "BOOT_PIPE".to_string()]
    }

    async fn invoke(
        &self,
        req: InvokeRequest,
    ) -> Result<Arc<dyn PipestanceHandle>, EngineError> {
        std::fs::create_dir_all(req.path.join("outs"))
            .map_err(|e| EngineError::new(e.to_string()))?;
        std::fs::write(req.path.join("_invocation"), &req.src)
            .map_err(|e| EngineError::new(e.to_string()))?;
        std::fs::write(req.path.join("outs/data.bin"), b"payload")
            .map_err(|e| EngineError::new(e.to_string()))?;

        let script = self.invoke_scripts.lock().unwrap().remove(&req.psid);
        let handle = Arc::new(match script {
            Some(script) => script.build(),
            None => ScriptedHandle::new(&[]),
        });
        self.handles
            .lock()
            .unwrap()
            .insert(req.psid.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    async fn reattach(
        &self,
        psid: &str,
        _path: &Path,
    ) -> Result<Arc<dyn PipestanceHandle>, EngineError> {
        self.reattached.lock().unwrap().push(psid.to_string());
        if self.fail_reattach.lock().unwrap().contains(psid) {
            return Err(EngineError::new(format!("cannot reattach {psid}")));
        }
        let script = self.reattach_scripts.lock().unwrap().remove(psid);
        let handle = Arc::new(match script {
            Some(script) => script.build(),
            None => ScriptedHandle::new(&[]),
        });
        self.handles
            .lock()
            .unwrap()
            .insert(psid.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

/// Job backend answering from a scripted queue (default: success).
pub struct MockJobBackend {
    pub responses: Mutex<VecDeque<Result<String, String>>>,
    pub patterns: Mutex<Vec<String>>,
}

impl MockJobBackend {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            patterns: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: Result<String, String>) {
        self.responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl JobBackend for MockJobBackend {
    async fn cancel_jobs(&self, pattern: &str) -> Result<String, String> {
        self.patterns.lock().unwrap().push(pattern.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Mailer capturing immediate sends.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Notification>>,
}

impl Mailer for RecordingMailer {
    fn send_immediate(&self, note: &Notification) {
        self.sent.lock().unwrap().push(note.clone());
    }
}

/// Probe reporting the same free-byte count for every volume.
pub struct FixedFree(pub u64);

impl FreeSpace for FixedFree {
    fn bytes_available(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Standard test configuration rooted under `dir`, with one scratch
/// volume and fast loop intervals.
pub fn test_config(dir: &Path) -> Config {
    let scratch0 = dir.join("scratch0");
    std::fs::create_dir_all(&scratch0).unwrap();
    let mut config = Config::with_roots(
        dir.join("pipestances"),
        vec![scratch0],
        dir.join("cache/pipestances"),
        dir.join("failcoop"),
    );
    config.process_interval = Duration::from_millis(10);
    config.clean_interval = Duration::from_millis(50);
    config
}

pub fn build_manager(
    config: Config,
    engine: Arc<MockEngine>,
    jobs: Arc<MockJobBackend>,
    mailer: Arc<RecordingMailer>,
    free_bytes: u64,
) -> Arc<PipestanceManager> {
    init_tracing();
    let allocator = ScratchAllocator::with_probe(
        config.scratch_paths.clone(),
        config.min_scratch_bytes,
        Box::new(FixedFree(free_bytes)),
    );
    Arc::new(PipestanceManager::with_allocator(
        config, allocator, engine, jobs, mailer,
    ))
}

/// Poll `predicate` until it holds or the timeout elapses.
pub async fn wait_for(predicate: impl Fn() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
