//! Status projection over pipeline events.
//!
//! Derives a small fixed set of user-facing phases (analyzing, writing
//! files, installing dependencies, starting the server) from the pipeline's
//! event stream. Purely a read-side view: it holds no authority over the
//! pipeline and never blocks or alters its behavior.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::pipeline::PipelineEvent;

/// The fixed display phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyzing,
    WritingFiles,
    InstallingDependencies,
    StartingServer,
}

const PHASES: [Phase; 4] = [
    Phase::Analyzing,
    Phase::WritingFiles,
    Phase::InstallingDependencies,
    Phase::StartingServer,
];

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Analyzing => "Analyzing request",
            Phase::WritingFiles => "Writing files",
            Phase::InstallingDependencies => "Installing dependencies",
            Phase::StartingServer => "Starting dev server",
        }
    }

    fn index(&self) -> usize {
        PHASES.iter().position(|p| p == self).expect("known phase")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    InProgress,
    Completed,
    Error,
}

/// One row of the progress display.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub state: PhaseState,
}

/// Recognize a package-manager install invocation from its raw command line.
fn is_install_command(raw: &str) -> bool {
    let mut tokens = raw.split_whitespace();
    let Some(command) = tokens.next() else {
        return false;
    };
    matches!(command, "npm" | "pnpm" | "yarn" | "bun")
        && tokens
            .next()
            .map(|sub| matches!(sub, "install" | "i" | "add" | "ci"))
            .unwrap_or(false)
}

/// Recognize a dev-server start from its raw command line.
fn is_dev_server_command(raw: &str) -> bool {
    let mut tokens = raw.split_whitespace();
    match tokens.next() {
        Some("vite" | "next" | "astro" | "nodemon") => true,
        Some("npm" | "pnpm" | "yarn" | "bun" | "npx") => {
            tokens.any(|sub| matches!(sub, "dev" | "start" | "serve" | "preview"))
        }
        _ => false,
    }
}

/// Projects pipeline events into per-phase states.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    states: [PhaseState; 4],
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            states: [PhaseState::Pending; 4],
        }
    }

    pub fn snapshot(&self) -> Vec<PhaseStatus> {
        PHASES
            .iter()
            .map(|&phase| PhaseStatus {
                phase,
                state: self.states[phase.index()],
            })
            .collect()
    }

    pub fn state(&self, phase: Phase) -> PhaseState {
        self.states[phase.index()]
    }

    fn set(&mut self, phase: Phase, state: PhaseState) {
        self.states[phase.index()] = state;
    }

    /// Mark `phase` in-progress, completing any earlier unfinished phase so
    /// at most one phase is ever in-progress.
    fn start_phase(&mut self, phase: Phase) {
        for earlier in &PHASES[..phase.index()] {
            if matches!(
                self.state(*earlier),
                PhaseState::Pending | PhaseState::InProgress
            ) {
                self.set(*earlier, PhaseState::Completed);
            }
        }
        self.set(phase, PhaseState::InProgress);
    }

    fn complete_through(&mut self, phase: Phase) {
        for p in &PHASES[..=phase.index()] {
            if self.state(*p) != PhaseState::Error {
                self.set(*p, PhaseState::Completed);
            }
        }
    }

    fn fail_current(&mut self) {
        for phase in PHASES {
            if self.state(phase) == PhaseState::InProgress {
                self.set(phase, PhaseState::Error);
                return;
            }
        }
    }

    /// Fold one pipeline event into the phase states.
    pub fn apply_event(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ApplyStart => self.start_phase(Phase::Analyzing),
            PipelineEvent::FileApplied { .. } => {
                self.complete_through(Phase::WritingFiles);
            }
            PipelineEvent::CommandStart { command } => {
                if is_install_command(command) {
                    self.start_phase(Phase::InstallingDependencies);
                } else if is_dev_server_command(command) {
                    self.start_phase(Phase::StartingServer);
                }
            }
            PipelineEvent::CommandComplete { command, .. } => {
                if is_install_command(command) {
                    self.set(Phase::InstallingDependencies, PhaseState::Completed);
                }
            }
            PipelineEvent::ApplyComplete { .. } => {
                self.complete_through(Phase::StartingServer);
            }
            PipelineEvent::ApplyError { .. } | PipelineEvent::CommandError { .. } => {
                self.fail_current();
            }
            PipelineEvent::CommandOutput { .. } => {}
        }
    }

    /// Consume pipeline events until the batch terminates (or the channel
    /// closes), logging phase transitions. Returns the final state.
    pub async fn observe(mut self, mut events: broadcast::Receiver<PipelineEvent>) -> Self {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let before = self.states;
                    let terminal = matches!(
                        event,
                        PipelineEvent::ApplyComplete { .. } | PipelineEvent::ApplyError { .. }
                    );
                    self.apply_event(&event);
                    for phase in PHASES {
                        if before[phase.index()] != self.state(phase) {
                            tracing::info!(
                                phase = phase.label(),
                                state = ?self.state(phase),
                                "progress"
                            );
                        }
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ApplySummary;

    fn start(command: &str) -> PipelineEvent {
        PipelineEvent::CommandStart {
            command: command.to_string(),
        }
    }

    fn complete(command: &str) -> PipelineEvent {
        PipelineEvent::CommandComplete {
            command: command.to_string(),
            exit_code: 0,
        }
    }

    #[test]
    fn test_command_recognition() {
        assert!(is_install_command("npm install"));
        assert!(is_install_command("pnpm add react"));
        assert!(!is_install_command("npm run dev"));
        assert!(!is_install_command("cargo install ripgrep"));

        assert!(is_dev_server_command("npm run dev"));
        assert!(is_dev_server_command("vite"));
        assert!(!is_dev_server_command("npm install"));
    }

    #[test]
    fn test_happy_path_projection() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_event(&PipelineEvent::ApplyStart);
        assert_eq!(tracker.state(Phase::Analyzing), PhaseState::InProgress);
        assert_eq!(tracker.state(Phase::WritingFiles), PhaseState::Pending);

        tracker.apply_event(&PipelineEvent::FileApplied {
            path: "index.html".to_string(),
        });
        assert_eq!(tracker.state(Phase::Analyzing), PhaseState::Completed);
        assert_eq!(tracker.state(Phase::WritingFiles), PhaseState::Completed);

        tracker.apply_event(&start("npm install"));
        assert_eq!(
            tracker.state(Phase::InstallingDependencies),
            PhaseState::InProgress
        );

        tracker.apply_event(&complete("npm install"));
        assert_eq!(
            tracker.state(Phase::InstallingDependencies),
            PhaseState::Completed
        );

        tracker.apply_event(&start("npm run dev"));
        assert_eq!(tracker.state(Phase::StartingServer), PhaseState::InProgress);

        tracker.apply_event(&PipelineEvent::ApplyComplete {
            summary: ApplySummary::default(),
        });
        assert_eq!(tracker.state(Phase::StartingServer), PhaseState::Completed);
    }

    #[test]
    fn test_error_marks_in_progress_phase() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_event(&PipelineEvent::ApplyStart);
        tracker.apply_event(&PipelineEvent::FileApplied {
            path: "a.js".to_string(),
        });
        tracker.apply_event(&start("npm install"));
        tracker.apply_event(&PipelineEvent::CommandError {
            command: "npm install".to_string(),
            message: "exited with code 1".to_string(),
        });
        assert_eq!(
            tracker.state(Phase::InstallingDependencies),
            PhaseState::Error
        );
        // earlier phases keep their completed state
        assert_eq!(tracker.state(Phase::WritingFiles), PhaseState::Completed);
    }

    #[test]
    fn test_at_most_one_phase_in_progress() {
        let mut tracker = ProgressTracker::new();
        let events = vec![
            PipelineEvent::ApplyStart,
            // no files at all: install starts straight away
            start("npm install"),
            complete("npm install"),
            start("npm run dev"),
        ];
        for event in &events {
            tracker.apply_event(event);
            let in_progress = tracker
                .snapshot()
                .iter()
                .filter(|s| s.state == PhaseState::InProgress)
                .count();
            assert!(in_progress <= 1);
        }
        // the skipped analyzing phase was folded into completed
        assert_eq!(tracker.state(Phase::Analyzing), PhaseState::Completed);
    }

    #[test]
    fn test_unrecognized_commands_do_not_move_phases() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_event(&PipelineEvent::ApplyStart);
        tracker.apply_event(&start("ls -la"));
        assert_eq!(
            tracker.state(Phase::InstallingDependencies),
            PhaseState::Pending
        );
        assert_eq!(tracker.state(Phase::Analyzing), PhaseState::InProgress);
    }
}
