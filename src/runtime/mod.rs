//! Sandboxed runtime lifecycle management.
//!
//! The [`RuntimeManager`] owns the sandbox boot/ready/degraded/teardown
//! lifecycle, process spawning, and health reporting. Boot is wrapped in
//! retry + circuit-breaker so a flapping sandbox backend cannot be hammered;
//! spawn gets a lighter retry since transient spawn failures are common.
//!
//! ## States
//!
//! ```text
//! uninitialized ──boot()──▶ booting ──▶ ready ──runtime error──▶ degraded
//!        ▲                     │           │                        │
//!        │              boot exhausted     └────────teardown────────┘
//!        │                     ▼                        │
//!        └──(re-boot)──── unhealthy                torn_down
//! ```

pub mod sandbox;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::resilience::{
    retry, retry_with_circuit_breaker, CircuitBreaker, RetryError, RetryOptions,
};
use sandbox::{
    Sandbox, SandboxChild, SandboxError, SandboxEvent, SandboxProvider, SpawnOptions,
};

/// Boot retry policy: 3 attempts, exponential backoff starting at 1s.
fn boot_retry_options() -> RetryOptions {
    RetryOptions {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
        timeout: None,
        retryable_kinds: Vec::new(),
    }
}

/// Spawn retry policy: transient spawn failures get one more chance.
fn spawn_retry_options() -> RetryOptions {
    RetryOptions {
        max_attempts: 2,
        initial_delay: Duration::from_millis(250),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
        jitter: false,
        timeout: None,
        retryable_kinds: Vec::new(),
    }
}

/// Boot circuit breaker: opens after 3 consecutive failures, probes again
/// after 60s, closes after 3 consecutive successes.
const BREAKER_FAILURE_THRESHOLD: u32 = 3;
const BREAKER_SUCCESS_THRESHOLD: u32 = 3;
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on buffered output retained by [`RuntimeManager::exec`].
const MAX_EXEC_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("sandbox runtime not initialized - call boot() first")]
    NotInitialized,

    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    #[error("sandbox boot rejected: circuit breaker is open")]
    CircuitOpen,

    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Lifecycle state of the managed runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Uninitialized,
    Booting,
    Ready,
    Degraded,
    Unhealthy,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl RuntimeState {
    fn health(self) -> HealthStatus {
        match self {
            RuntimeState::Ready => HealthStatus::Healthy,
            RuntimeState::Degraded => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Read-only health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    pub status: HealthStatus,
    /// Time since boot; zero unless the runtime is `Ready`.
    pub uptime: std::time::Duration,
    pub process_count: usize,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Events surfaced to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ServerReady { port: u16, url: String },
    PortOpen { port: u16, url: String },
    HealthChanged { status: HealthStatus },
}

/// Opaque handle into the process pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessId(u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Metadata about a pooled process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

struct ProcessEntry {
    info: ProcessInfo,
    /// Present for long-running processes parked in the pool (e.g. a dev
    /// server); dropping the entry kills the process.
    child: Option<SandboxChild>,
}

/// Arena of spawned processes keyed by stable opaque ids.
#[derive(Default)]
struct ProcessPool {
    next_id: u64,
    entries: HashMap<u64, ProcessEntry>,
}

impl ProcessPool {
    fn insert(&mut self, command: &str) -> ProcessId {
        self.next_id += 1;
        let id = ProcessId(self.next_id);
        self.entries.insert(
            self.next_id,
            ProcessEntry {
                info: ProcessInfo {
                    id,
                    command: command.to_string(),
                    started_at: Utc::now(),
                },
                child: None,
            },
        );
        id
    }
}

/// Result of a one-shot [`RuntimeManager::exec`].
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
}

struct RuntimeInner {
    provider: Box<dyn SandboxProvider>,
    boot_options: RetryOptions,
    spawn_options: RetryOptions,
    breaker: CircuitBreaker,
    state: RwLock<RuntimeState>,
    sandbox: RwLock<Option<Arc<dyn Sandbox>>>,
    /// Serializes boot/teardown; concurrent boot() callers share one attempt.
    boot_lock: Mutex<()>,
    started_at: RwLock<Option<Instant>>,
    last_error: RwLock<Option<(String, DateTime<Utc>)>>,
    preview_url: RwLock<Option<String>>,
    pool: Mutex<ProcessPool>,
    events: broadcast::Sender<RuntimeEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeInner {
    async fn record_error(&self, message: String) {
        tracing::warn!(error = %message, "runtime error recorded");
        *self.last_error.write().await = Some((message, Utc::now()));
    }

    async fn set_state(&self, next: RuntimeState) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = next;
            previous
        };
        if previous.health() != next.health() {
            let _ = self.events.send(RuntimeEvent::HealthChanged {
                status: next.health(),
            });
        }
    }
}

/// Owner of the sandbox lifecycle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RuntimeManager {
    inner: Arc<RuntimeInner>,
}

impl RuntimeManager {
    pub fn new(provider: Box<dyn SandboxProvider>) -> Self {
        Self::with_policy(
            provider,
            boot_retry_options(),
            CircuitBreaker::new(
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_SUCCESS_THRESHOLD,
                BREAKER_RESET_TIMEOUT,
            ),
        )
    }

    /// Construct with an explicit boot policy. Used by tests to shrink delays.
    pub fn with_policy(
        provider: Box<dyn SandboxProvider>,
        boot_options: RetryOptions,
        breaker: CircuitBreaker,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RuntimeInner {
                provider,
                boot_options,
                spawn_options: spawn_retry_options(),
                breaker,
                state: RwLock::new(RuntimeState::Uninitialized),
                sandbox: RwLock::new(None),
                boot_lock: Mutex::new(()),
                started_at: RwLock::new(None),
                last_error: RwLock::new(None),
                preview_url: RwLock::new(None),
                pool: Mutex::new(ProcessPool::default()),
                events,
                listener: Mutex::new(None),
            }),
        }
    }

    pub async fn state(&self) -> RuntimeState {
        *self.inner.state.read().await
    }

    pub fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Preview URL captured from the sandbox's server-ready event, if any.
    pub async fn preview_url(&self) -> Option<String> {
        self.inner.preview_url.read().await.clone()
    }

    /// The booted sandbox, or [`RuntimeError::NotInitialized`].
    ///
    /// A degraded runtime is still operational; only the lifecycle states
    /// before `Ready` and after teardown reject operations.
    pub async fn sandbox(&self) -> Result<Arc<dyn Sandbox>, RuntimeError> {
        let state = *self.inner.state.read().await;
        if !matches!(state, RuntimeState::Ready | RuntimeState::Degraded) {
            return Err(RuntimeError::NotInitialized);
        }
        self.inner
            .sandbox
            .read()
            .await
            .clone()
            .ok_or(RuntimeError::NotInitialized)
    }

    /// Boot the sandbox. Idempotent: an already-ready runtime returns the
    /// existing handle, and concurrent callers share a single boot attempt.
    pub async fn boot(&self) -> Result<Arc<dyn Sandbox>, RuntimeError> {
        let _guard = self.inner.boot_lock.lock().await;

        if let Some(existing) = self.inner.sandbox.read().await.clone() {
            if matches!(
                *self.inner.state.read().await,
                RuntimeState::Ready | RuntimeState::Degraded
            ) {
                return Ok(existing);
            }
        }

        self.inner.set_state(RuntimeState::Booting).await;
        tracing::info!("booting sandbox runtime");

        let provider = &self.inner.provider;
        let result = retry_with_circuit_breaker(
            || provider.boot(),
            &self.inner.boot_options,
            &self.inner.breaker,
        )
        .await;

        match result {
            Ok(sandbox) => {
                self.install_listener(&sandbox).await;
                *self.inner.sandbox.write().await = Some(Arc::clone(&sandbox));
                *self.inner.started_at.write().await = Some(Instant::now());
                self.inner.set_state(RuntimeState::Ready).await;
                tracing::info!("sandbox runtime ready");
                Ok(sandbox)
            }
            Err(err) => {
                self.inner.record_error(err.to_string()).await;
                self.inner.set_state(RuntimeState::Unhealthy).await;
                tracing::error!(error = %err, "sandbox boot failed");
                Err(match err {
                    RetryError::CircuitOpen => RuntimeError::CircuitOpen,
                    other => RuntimeError::BootFailed(other.to_string()),
                })
            }
        }
    }

    /// Forward sandbox events: capture the preview URL on server-ready,
    /// degrade health on runtime errors (without tearing down).
    async fn install_listener(&self, sandbox: &Arc<dyn Sandbox>) {
        let mut rx = sandbox.events();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SandboxEvent::ServerReady { port, url }) => {
                        tracing::info!(port, url = %url, "dev server ready");
                        *inner.preview_url.write().await = Some(url.clone());
                        let _ = inner.events.send(RuntimeEvent::ServerReady { port, url });
                    }
                    Ok(SandboxEvent::PortOpen { port, url }) => {
                        let _ = inner.events.send(RuntimeEvent::PortOpen { port, url });
                    }
                    Ok(SandboxEvent::Error { message }) => {
                        inner.record_error(message).await;
                        let degraded = {
                            let state = inner.state.read().await;
                            *state == RuntimeState::Ready
                        };
                        if degraded {
                            inner.set_state(RuntimeState::Degraded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "sandbox event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.inner.listener.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Spawn a process in the sandbox. Requires a booted runtime; transient
    /// spawn failures are retried once before surfacing.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<(ProcessId, SandboxChild), RuntimeError> {
        let sandbox = self.sandbox().await?;
        let child = retry(
            || sandbox.spawn(command, args, options.clone()),
            &self.inner.spawn_options,
        )
        .await
        .map_err(|e| RuntimeError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;

        let id = self.inner.pool.lock().await.insert(command);
        tracing::debug!(%id, command = %command, "process pooled");
        Ok((id, child))
    }

    /// One-shot execution: spawn, drain output, await the exit code.
    /// A non-zero exit code is a normal result, not an error.
    pub async fn exec(&self, command: &str, args: &[String]) -> Result<ExecResult, RuntimeError> {
        let (id, mut child) = self.spawn(command, args, SpawnOptions::default()).await?;
        let mut output = String::new();
        let mut truncated = false;
        while let Some(line) = child.next_line().await {
            if output.len() < MAX_EXEC_OUTPUT {
                output.push_str(&line);
                output.push('\n');
            } else {
                truncated = true;
            }
        }
        if truncated {
            output.push_str("... [output truncated]");
        }
        let exit_code = child.wait().await?;
        self.release_process(id).await;
        Ok(ExecResult { exit_code, output })
    }

    /// Park a long-running process's handle in the pool so it outlives the
    /// caller (dropping a [`SandboxChild`] kills the process).
    pub async fn park_process(&self, id: ProcessId, child: SandboxChild) {
        if let Some(entry) = self.inner.pool.lock().await.entries.get_mut(&id.0) {
            entry.child = Some(child);
        }
    }

    /// Drop a process from the pool.
    pub async fn release_process(&self, id: ProcessId) {
        self.inner.pool.lock().await.entries.remove(&id.0);
    }

    /// Metadata for every pooled process.
    pub async fn processes(&self) -> Vec<ProcessInfo> {
        self.inner
            .pool
            .lock()
            .await
            .entries
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Current health snapshot. Uptime only accrues while `Ready`.
    pub async fn get_health(&self) -> RuntimeHealth {
        let state = *self.inner.state.read().await;
        let uptime = if state == RuntimeState::Ready {
            self.inner
                .started_at
                .read()
                .await
                .map(|at| at.elapsed())
                .unwrap_or_default()
        } else {
            std::time::Duration::ZERO
        };
        let (last_error, last_error_time) = match self.inner.last_error.read().await.clone() {
            Some((message, at)) => (Some(message), Some(at)),
            None => (None, None),
        };
        RuntimeHealth {
            status: state.health(),
            uptime,
            process_count: self.inner.pool.lock().await.entries.len(),
            last_error,
            last_error_time,
        }
    }

    /// Tear down the sandbox, kill pooled processes, and reset. Safe to call
    /// when never booted.
    pub async fn teardown(&self) -> Result<(), RuntimeError> {
        let _guard = self.inner.boot_lock.lock().await;

        if let Some(listener) = self.inner.listener.lock().await.take() {
            listener.abort();
        }
        self.inner.pool.lock().await.entries.clear();
        *self.inner.started_at.write().await = None;
        *self.inner.preview_url.write().await = None;

        let sandbox = self.inner.sandbox.write().await.take();
        match sandbox {
            Some(sandbox) => {
                if let Err(e) = sandbox.teardown().await {
                    tracing::warn!(error = %e, "sandbox teardown reported an error");
                }
                self.inner.set_state(RuntimeState::TornDown).await;
                tracing::info!("runtime torn down");
            }
            None => {
                // Never booted: nothing to do.
                tracing::debug!("teardown requested before boot; no-op");
            }
        }
        Ok(())
    }
}
