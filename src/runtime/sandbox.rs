//! Sandbox execution environment abstraction.
//!
//! A [`Sandbox`] is a path-addressed virtual filesystem plus process spawning,
//! owned by the runtime manager. [`LocalSandbox`] implements it over an
//! isolated workspace directory on the host; other backends (containers,
//! remote runners) can slot in behind the same trait.
//!
//! All sandbox paths are relative, slash-delimited, and never begin with a
//! leading slash. `..` segments are rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::resilience::{ClassifyError, ErrorKind};

/// Buffered lines per process before the output pump applies backpressure.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox I/O failure at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path escapes the sandbox root: {0}")]
    PathEscape(String),

    #[error("not found in sandbox: {0}")]
    NotFound(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox boot failed: {0}")]
    Boot(String),
}

impl ClassifyError for SandboxError {
    fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Io { .. } => ErrorKind::Io,
            SandboxError::Spawn { .. } => ErrorKind::Spawn,
            SandboxError::Boot(_) => ErrorKind::Unavailable,
            SandboxError::PathEscape(_) | SandboxError::NotFound(_) => ErrorKind::Other,
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Events reported by a running sandbox.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    /// A dev server inside the sandbox is accepting connections.
    ServerReady { port: u16, url: String },
    /// A listening port was observed.
    PortOpen { port: u16, url: String },
    /// The sandbox reported a runtime error (non-fatal).
    Error { message: String },
}

/// One entry from [`Sandbox::read_dir`].
#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Options for [`Sandbox::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory, relative to the sandbox root.
    pub cwd: Option<String>,
    /// Extra environment variables for the process.
    pub env: HashMap<String, String>,
}

/// Handle to a process running inside the sandbox: a writable input stream,
/// a readable line-output stream, and an awaitable exit code.
pub struct SandboxChild {
    pub stdin: Option<ChildStdin>,
    output: Option<mpsc::Receiver<String>>,
    child: Child,
    command: String,
}

impl SandboxChild {
    /// Next sanitized output line (stdout and stderr interleaved), or `None`
    /// once the process has closed both streams (or the receiver was taken).
    pub async fn next_line(&mut self) -> Option<String> {
        match &mut self.output {
            Some(output) => output.recv().await,
            None => None,
        }
    }

    /// Detach the output receiver, e.g. to drain a long-running process from
    /// a separate task while the handle itself is parked.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    /// Await process exit. A non-zero exit code is not an error.
    pub async fn wait(&mut self) -> SandboxResult<i32> {
        let status = self.child.wait().await.map_err(|source| SandboxError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl std::fmt::Debug for SandboxChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxChild")
            .field("command", &self.command)
            .finish()
    }
}

/// The sandbox boundary: path-addressed filesystem access plus process
/// execution. All mutation of the execution environment goes through this
/// trait; nothing else may touch the sandbox filesystem directly.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Read a file as UTF-8 text.
    async fn read_file(&self, path: &str) -> SandboxResult<String>;

    /// Write a file. Parent directories must already exist.
    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()>;

    /// Create a single directory. Already existing is not an error.
    async fn mkdir(&self, path: &str) -> SandboxResult<()>;

    /// Remove a file, or a directory when `recursive` is set.
    async fn remove(&self, path: &str, recursive: bool) -> SandboxResult<()>;

    /// List the entries of a directory.
    async fn read_dir(&self, path: &str) -> SandboxResult<Vec<SandboxEntry>>;

    /// Spawn a process inside the sandbox.
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> SandboxResult<SandboxChild>;

    /// Subscribe to sandbox events (server-ready, port, error).
    fn events(&self) -> broadcast::Receiver<SandboxEvent>;

    /// Tear down the sandbox. Idempotent.
    async fn teardown(&self) -> SandboxResult<()>;
}

/// Boot seam for the runtime manager; implementations may fail transiently
/// and are retried behind the manager's retry/circuit-breaker policy.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn boot(&self) -> SandboxResult<Arc<dyn Sandbox>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Local workspace sandbox
// ─────────────────────────────────────────────────────────────────────────────

/// Sandbox rooted at a workspace directory on the host.
pub struct LocalSandbox {
    id: Uuid,
    root: PathBuf,
    events: broadcast::Sender<SandboxEvent>,
}

impl LocalSandbox {
    pub fn new(root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: Uuid::new_v4(),
            root,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a sandbox-relative path against the workspace root.
    ///
    /// Rejects absolute paths and any `..` segment.
    fn resolve(&self, path: &str) -> SandboxResult<PathBuf> {
        if path.starts_with('/') {
            return Err(SandboxError::PathEscape(path.to_string()));
        }
        let mut resolved = self.root.clone();
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(SandboxError::PathEscape(path.to_string()));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }

    fn io_err(path: &str, source: std::io::Error) -> SandboxError {
        if source.kind() == std::io::ErrorKind::NotFound {
            SandboxError::NotFound(path.to_string())
        } else {
            SandboxError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| Self::io_err(path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let resolved = self.resolve(path)?;
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| Self::io_err(path, e))
    }

    async fn mkdir(&self, path: &str) -> SandboxResult<()> {
        let resolved = self.resolve(path)?;
        match tokio::fs::create_dir(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Self::io_err(path, e)),
        }
    }

    async fn remove(&self, path: &str, recursive: bool) -> SandboxResult<()> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Self::io_err(path, e))?;
        let result = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&resolved).await
            } else {
                tokio::fs::remove_dir(&resolved).await
            }
        } else {
            tokio::fs::remove_file(&resolved).await
        };
        result.map_err(|e| Self::io_err(path, e))
    }

    async fn read_dir(&self, path: &str) -> SandboxResult<Vec<SandboxEntry>> {
        let resolved = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| Self::io_err(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Self::io_err(path, e))?
        {
            let file_type = entry.file_type().await.map_err(|e| Self::io_err(path, e))?;
            entries.push(SandboxEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> SandboxResult<SandboxChild> {
        let cwd = match &options.cwd {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !options.env.is_empty() {
            cmd.envs(&options.env);
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.to_string(),
            source,
        })?;

        tracing::debug!(sandbox = %self.id, command = %command, ?args, "spawned process");

        let stdin = child.stdin.take();
        let (tx, output) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let announced = Arc::new(AtomicBool::new(false));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(
                stdout,
                tx.clone(),
                self.events.clone(),
                Arc::clone(&announced),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, tx, self.events.clone(), announced));
        }

        Ok(SandboxChild {
            stdin,
            output: Some(output),
            child,
            command: command.to_string(),
        })
    }

    fn events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) -> SandboxResult<()> {
        tracing::info!(sandbox = %self.id, root = %self.root.display(), "sandbox torn down");
        Ok(())
    }
}

/// Boots a [`LocalSandbox`], creating the workspace root if needed.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn boot(&self) -> SandboxResult<Arc<dyn Sandbox>> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SandboxError::Boot(format!("workspace root unavailable: {}", e)))?;
        let sandbox = LocalSandbox::new(self.root.clone());
        tracing::info!(sandbox = %sandbox.id(), root = %self.root.display(), "sandbox booted");
        Ok(Arc::new(sandbox))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process output pump
// ─────────────────────────────────────────────────────────────────────────────

fn dev_server_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:https?://)?(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{2,5})")
            .expect("dev server url pattern")
    })
}

/// Strip invalid UTF-8 and control characters from a raw output line,
/// keeping tabs.
fn sanitize_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(['\n', '\r'])
        .chars()
        .filter(|&c| c == '\t' || !c.is_control())
        .collect()
}

async fn pump_output<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<String>,
    events: broadcast::Sender<SandboxEvent>,
    announced: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = sanitize_line(&buf);
                announce_server_ready(&line, &events, &announced);
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("process output stream closed: {}", e);
                break;
            }
        }
    }
}

/// Detect a dev-server URL in process output and publish readiness events.
/// Fires at most once per process.
fn announce_server_ready(
    line: &str,
    events: &broadcast::Sender<SandboxEvent>,
    announced: &AtomicBool,
) {
    let Some(captures) = dev_server_url_regex().captures(line) else {
        return;
    };
    let Ok(port) = captures[1].parse::<u16>() else {
        return;
    };
    if announced.swap(true, Ordering::SeqCst) {
        return;
    }
    let url = format!("http://localhost:{}", port);
    let _ = events.send(SandboxEvent::PortOpen {
        port,
        url: url.clone(),
    });
    let _ = events.send(SandboxEvent::ServerReady { port, url });
}
