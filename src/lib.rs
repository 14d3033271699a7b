//! # appforge
//!
//! Engine that turns streamed AI coding responses into a running application
//! inside a sandboxed workspace.
//!
//! A structured model response (planning steps, file contents, shell
//! commands) is parsed incrementally and applied to a sandbox: files are
//! written, dependencies installed, and a dev server booted, with the
//! resulting file tree and preview URL surfaced through typed event
//! channels.
//!
//! ## Architecture
//!
//! ```text
//!   AI text stream
//!        │
//!        ▼
//!  ┌─────────────┐     ┌────────────────────┐     ┌──────────────────┐
//!  │   parser    │────▶│  ResponsePipeline  │────▶│ FileSystemService│
//!  │ (blocks /   │     │ (batch + streaming │     │ (virtual tree +  │
//!  │  commands)  │     │  application)      │     │  reconciliation) │
//!  └─────────────┘     └─────────┬──────────┘     └────────┬─────────┘
//!                                │                         │
//!                                ▼                         ▼
//!                      ┌──────────────────┐       ┌────────────────┐
//!                      │  RuntimeManager  │──────▶│    Sandbox     │
//!                      │ (boot / spawn /  │       │ (workspace fs  │
//!                      │  health / retry) │       │  + processes)  │
//!                      └──────────────────┘       └────────────────┘
//! ```
//!
//! ## Flow
//! 1. Chunks of model output accumulate in the streaming parser
//! 2. Completed code blocks are written through the filesystem service
//! 3. Shell commands run sequentially through the runtime manager
//! 4. Pipeline events feed the progress projection and any UI observers
//!
//! ## Modules
//! - `resilience`: retry-with-backoff and circuit-breaker primitives
//! - `runtime`: sandbox abstraction and lifecycle management
//! - `fs`: virtual file tree and filesystem service
//! - `parser`: streaming response parser
//! - `pipeline`: response application pipeline
//! - `progress`: phase projection over pipeline events

pub mod config;
pub mod fs;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod resilience;
pub mod runtime;

pub use config::Config;
pub use fs::tree::FileSystemNode;
pub use fs::{FileOperation, FileSystemService, FsEvent};
pub use pipeline::{ApplySummary, PipelineEvent, ResponsePipeline};
pub use progress::{Phase, PhaseState, ProgressTracker};
pub use runtime::{RuntimeHealth, RuntimeManager};
