//! Response application pipeline.
//!
//! Orchestrates parsed AI output into side effects: file blocks become batch
//! operations against the filesystem service, shell commands are executed
//! sequentially through the runtime manager. Two modes:
//!
//! - **batch** ([`ResponsePipeline::apply_code`]): parse the complete text
//!   once and apply everything;
//! - **streaming** ([`ResponsePipeline::stream_and_apply`]): write each code
//!   block as soon as its closing fence arrives, then run the batch pass
//!   once more on completion as a correctness backstop.
//!
//! Event contract: `ApplyStart` fires exactly once and precedes every file
//! and command event; exactly one of `ApplyComplete` / `ApplyError`
//! terminates the batch. Individual file or command failures are absorbed
//! into error events and never abort siblings — one bad file must not lose
//! an entire multi-file generation.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::fs::{FileOperation, FileSystemService, FsError};
use crate::parser::{self, ParsedCommand, StreamingParser};
use crate::runtime::sandbox::SpawnOptions;
use crate::runtime::{RuntimeError, RuntimeManager};

/// Package managers whose output is surfaced incrementally.
const PACKAGE_MANAGERS: &[&str] = &["npm", "pnpm", "yarn", "bun", "npx"];

/// Commands that start a long-running dev server directly.
const DEV_SERVER_COMMANDS: &[&str] = &["vite", "next", "astro", "nodemon"];

/// Command prefixes blocked before execution. AI-generated scripts
/// occasionally hallucinate destructive cleanup steps.
const DANGEROUS_PATTERNS: &[&str] = &["rm -rf /", "dd if=/dev/", "mkfs", "shutdown", "reboot"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("response stream failed: {0}")]
    Stream(String),
}

/// Counts returned by a completed application pass.
///
/// `files_updated` is always zero: this layer does not distinguish update
/// from create (writing to an existing path overwrites it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub files_created: usize,
    pub files_updated: usize,
    pub commands_succeeded: usize,
}

/// Pipeline lifecycle events — the only contract surface other components
/// may depend on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ApplyStart,
    FileApplied { path: String },
    ApplyComplete { summary: ApplySummary },
    ApplyError { message: String },
    CommandStart { command: String },
    CommandOutput { command: String, line: String },
    CommandComplete { command: String, exit_code: i32 },
    CommandError { command: String, message: String },
}

fn is_package_manager(parsed: &ParsedCommand) -> bool {
    PACKAGE_MANAGERS.contains(&parsed.command.as_str())
}

/// Whether this command boots a dev server that runs indefinitely: either a
/// known server binary, or a package-manager script invocation like
/// `npm run dev` / `yarn start`.
fn is_dev_server_command(parsed: &ParsedCommand) -> bool {
    if DEV_SERVER_COMMANDS.contains(&parsed.command.as_str()) {
        return true;
    }
    is_package_manager(parsed)
        && parsed
            .args
            .iter()
            .any(|arg| matches!(arg.as_str(), "dev" | "start" | "serve" | "preview"))
}

fn validate_command(raw: &str) -> Result<(), String> {
    let trimmed = raw.trim();
    for pattern in DANGEROUS_PATTERNS {
        if trimmed.starts_with(pattern) {
            return Err(format!("blocked dangerous command pattern '{}'", pattern));
        }
    }
    Ok(())
}

/// Incremental UTF-8 decoder: chunk boundaries may split a codepoint, so a
/// partial trailing sequence is held back until the next chunk.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_string();
                self.pending.clear();
                out
            }
            Err(error) => {
                let valid = error.valid_up_to();
                let consumed = match error.error_len() {
                    // invalid sequence: replace it and move on
                    Some(len) => valid + len,
                    // incomplete trailing sequence: keep it pending
                    None => valid,
                };
                let out = String::from_utf8_lossy(&self.pending[..consumed]).into_owned();
                self.pending.drain(..consumed);
                out
            }
        }
    }
}

/// Orchestrator turning parsed AI responses into filesystem and process
/// side effects. Cheap to clone; clones share the event channel.
#[derive(Clone)]
pub struct ResponsePipeline {
    fs: FileSystemService,
    runtime: RuntimeManager,
    events: broadcast::Sender<PipelineEvent>,
}

impl ResponsePipeline {
    pub fn new(fs: FileSystemService, runtime: RuntimeManager) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            fs,
            runtime,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    /// Batch mode: parse the complete text once and apply everything.
    pub async fn apply_code(&self, text: &str) -> Result<ApplySummary, PipelineError> {
        self.emit(PipelineEvent::ApplyStart);
        self.apply_parsed(text).await
    }

    /// The shared application pass; assumes `ApplyStart` was already emitted.
    async fn apply_parsed(&self, text: &str) -> Result<ApplySummary, PipelineError> {
        let blocks = parser::extract_code_blocks(text);
        let commands = parser::extract_commands(text);
        tracing::info!(
            files = blocks.len(),
            commands = commands.len(),
            "applying parsed response"
        );

        let operations: Vec<FileOperation> = blocks
            .iter()
            .map(|block| FileOperation::Create {
                path: block.filename.clone(),
                content: block.content.clone(),
            })
            .collect();

        // Only a failed submission (e.g. runtime not booted) aborts the
        // batch; per-operation failures are absorbed below.
        let outcomes = match self.fs.apply_operations(&operations).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.emit(PipelineEvent::ApplyError {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let mut summary = ApplySummary::default();
        for outcome in &outcomes {
            if outcome.succeeded() {
                summary.files_created += 1;
                self.emit(PipelineEvent::FileApplied {
                    path: outcome.operation.path().to_string(),
                });
            }
        }

        for command in &commands {
            if self.run_command(command).await {
                summary.commands_succeeded += 1;
            }
        }

        self.emit(PipelineEvent::ApplyComplete {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Streaming mode: decode chunk by chunk, write each code block as soon
    /// as it completes, then run the batch pass once more on completion.
    ///
    /// The backstop pass re-submits blocks the incremental pass already
    /// wrote; those writes are idempotent and the duplicate `FileApplied`
    /// notifications are benign.
    pub async fn stream_and_apply<S, E>(&self, stream: S) -> Result<ApplySummary, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.emit(PipelineEvent::ApplyStart);

        let mut parser = StreamingParser::new();
        let mut decoder = Utf8Decoder::default();
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.emit(PipelineEvent::ApplyError {
                        message: e.to_string(),
                    });
                    return Err(PipelineError::Stream(e.to_string()));
                }
            };
            let text = decoder.decode(&chunk);
            for block in parser.push_chunk(&text) {
                match self.fs.create_file(&block.filename, &block.content).await {
                    Ok(()) => {
                        tracing::debug!(path = %block.filename, "applied streamed block");
                        self.emit(PipelineEvent::FileApplied {
                            path: block.filename.clone(),
                        });
                    }
                    Err(e) => {
                        // the final batch pass retries this block
                        tracing::warn!(
                            path = %block.filename,
                            error = %e,
                            "incremental write failed"
                        );
                    }
                }
            }
        }

        self.apply_parsed(parser.buffer()).await
    }

    /// Execute one parsed command; returns whether it succeeded. All
    /// failures are absorbed into `CommandError` events.
    async fn run_command(&self, parsed: &ParsedCommand) -> bool {
        self.emit(PipelineEvent::CommandStart {
            command: parsed.raw.clone(),
        });

        if let Err(reason) = validate_command(&parsed.raw) {
            tracing::warn!(command = %parsed.raw, reason = %reason, "command blocked");
            self.emit(PipelineEvent::CommandError {
                command: parsed.raw.clone(),
                message: reason,
            });
            return false;
        }

        let result = if is_dev_server_command(parsed) {
            self.start_dev_server(parsed).await
        } else if is_package_manager(parsed) {
            self.run_streaming(parsed).await
        } else {
            self.run_buffered(parsed).await
        };

        match result {
            Ok(0) => {
                self.emit(PipelineEvent::CommandComplete {
                    command: parsed.raw.clone(),
                    exit_code: 0,
                });
                true
            }
            Ok(exit_code) => {
                tracing::warn!(command = %parsed.raw, exit_code, "command failed");
                self.emit(PipelineEvent::CommandError {
                    command: parsed.raw.clone(),
                    message: format!("exited with code {}", exit_code),
                });
                false
            }
            Err(e) => {
                tracing::warn!(command = %parsed.raw, error = %e, "command errored");
                self.emit(PipelineEvent::CommandError {
                    command: parsed.raw.clone(),
                    message: e.to_string(),
                });
                false
            }
        }
    }

    /// One-shot command with buffered output.
    async fn run_buffered(&self, parsed: &ParsedCommand) -> Result<i32, RuntimeError> {
        let result = self.runtime.exec(&parsed.command, &parsed.args).await?;
        Ok(result.exit_code)
    }

    /// Package-manager command: output is surfaced line by line while the
    /// command runs, since installs are slow and users watch them.
    async fn run_streaming(&self, parsed: &ParsedCommand) -> Result<i32, RuntimeError> {
        let (id, mut child) = self
            .runtime
            .spawn(&parsed.command, &parsed.args, SpawnOptions::default())
            .await?;
        while let Some(line) = child.next_line().await {
            self.emit(PipelineEvent::CommandOutput {
                command: parsed.raw.clone(),
                line,
            });
        }
        let exit_code = child.wait().await?;
        self.runtime.release_process(id).await;
        Ok(exit_code)
    }

    /// Dev-server command: spawn it, keep it alive in the process pool, and
    /// report success once it is running. The server is expected to run
    /// indefinitely; awaiting its exit would hang the batch.
    async fn start_dev_server(&self, parsed: &ParsedCommand) -> Result<i32, RuntimeError> {
        let (id, mut child) = self
            .runtime
            .spawn(&parsed.command, &parsed.args, SpawnOptions::default())
            .await?;
        if let Some(mut output) = child.take_output() {
            let events = self.events.clone();
            let command = parsed.raw.clone();
            tokio::spawn(async move {
                while let Some(line) = output.recv().await {
                    let _ = events.send(PipelineEvent::CommandOutput {
                        command: command.clone(),
                        line,
                    });
                }
            });
        }
        self.runtime.park_process(id, child).await;
        tracing::info!(command = %parsed.raw, %id, "dev server started");
        Ok(0)
    }
}
