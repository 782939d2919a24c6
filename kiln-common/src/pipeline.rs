// kiln-common/src/pipeline.rs
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

// --- Build stages and the per-formula state machine ---

/// A stage of a formula build. Named after the state the executor is in while the stage runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    Configuring,
    Building,
    Installing,
    PostInstall(String),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pending => write!(f, "Pending"),
            Stage::Configuring => write!(f, "Configuring"),
            Stage::Building => write!(f, "Building"),
            Stage::Installing => write!(f, "Installing"),
            Stage::PostInstall(name) => write!(f, "PostInstall({name})"),
        }
    }
}

/// Why a stage did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageFailure {
    ExitCode(i32),
    Timeout(Duration),
    /// Killed by a signal, no exit code available.
    Terminated,
    /// The command could not be started, or a non-process step failed.
    Spawn(String),
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::ExitCode(code) => write!(f, "exit code {code}"),
            StageFailure::Timeout(d) => write!(f, "timed out after {}", humantime::format_duration(*d)),
            StageFailure::Terminated => write!(f, "terminated by signal"),
            StageFailure::Spawn(msg) => write!(f, "{msg}"),
        }
    }
}

/// State of one formula inside the build executor.
///
/// `Pending -> Configuring -> Building -> Installing -> [PostInstall(..)]* -> Done`, with `Failed`
/// reachable from every non-terminal state. Nothing leaves `Done` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Pending,
    Configuring,
    Building,
    Installing,
    PostInstall(String),
    Done,
    Failed { stage: Stage, failure: StageFailure },
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Done => write!(f, "Done"),
            BuildState::Failed { stage, failure } => write!(f, "Failed({stage}, {failure})"),
            other => match other.stage() {
                Some(stage) => write!(f, "{stage}"),
                None => write!(f, "{other:?}"),
            },
        }
    }
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Failed { .. })
    }

    /// The stage this state corresponds to, `None` for terminal states.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildState::Pending => Some(Stage::Pending),
            BuildState::Configuring => Some(Stage::Configuring),
            BuildState::Building => Some(Stage::Building),
            BuildState::Installing => Some(Stage::Installing),
            BuildState::PostInstall(name) => Some(Stage::PostInstall(name.clone())),
            BuildState::Done | BuildState::Failed { .. } => None,
        }
    }

    pub fn can_transition_to(&self, next: &BuildState) -> bool {
        use BuildState::*;
        match (self, next) {
            (Done, _) | (Failed { .. }, _) => false,
            (_, Failed { .. }) => true,
            (Pending, Configuring) => true,
            (Configuring, Building) => true,
            (Building, Installing) => true,
            (Installing, PostInstall(_)) | (Installing, Done) => true,
            (PostInstall(_), PostInstall(_)) | (PostInstall(_), Done) => true,
            _ => false,
        }
    }

    pub fn advance(self, next: BuildState) -> Result<BuildState> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(KilnError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Fails the stage the machine is currently in.
    pub fn fail(self, failure: StageFailure) -> Result<BuildState> {
        match self.stage() {
            Some(stage) => Ok(BuildState::Failed { stage, failure }),
            None => Err(KilnError::InvalidTransition {
                from: self.to_string(),
                to: format!("Failed({failure})"),
            }),
        }
    }
}

// --- Orchestrator-level status ---

/// Final status of one formula in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormulaStatus {
    Done,
    Failed { reason: String },
    Skipped { failed_dependency: String },
}

impl fmt::Display for FormulaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaStatus::Done => write!(f, "Done"),
            FormulaStatus::Failed { reason } => write!(f, "Failed: {reason}"),
            FormulaStatus::Skipped { failed_dependency } => {
                write!(f, "Skipped (dependency '{failed_dependency}' failed)")
            }
        }
    }
}

/// Outcome of a whole run, in plan order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub statuses: Vec<(String, FormulaStatus)>,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn status_of(&self, name: &str) -> Option<&FormulaStatus> {
        self.statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, status)| status)
    }

    pub fn succeeded(&self) -> usize {
        self.statuses
            .iter()
            .filter(|(_, s)| matches!(s, FormulaStatus::Done))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.statuses
            .iter()
            .filter(|(_, s)| matches!(s, FormulaStatus::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.statuses
            .iter()
            .filter(|(_, s)| matches!(s, FormulaStatus::Skipped { .. }))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.statuses
            .iter()
            .all(|(_, s)| matches!(s, FormulaStatus::Done))
    }
}

// --- Events broadcast to the CLI ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
        skip_count: usize,
    },
    JobDispatched {
        target_id: String,
    },
    FetchStarted {
        target_id: String,
        url: String,
    },
    FetchRetry {
        target_id: String,
        url: String,
        attempt: u32,
        error: String,
    },
    FetchFinished {
        target_id: String,
        url: String,
    },
    StageStarted {
        target_id: String,
        stage: Stage,
    },
    StageFinished {
        target_id: String,
        stage: Stage,
    },
    ConfigWritten {
        target_id: String,
        path: String,
    },
    JobSuccess {
        target_id: String,
    },
    JobFailed {
        target_id: String,
        error: String,
    },
    JobSkipped {
        target_id: String,
        failed_dependency: String,
    },
    LogWarn {
        message: String,
    },
}

impl PipelineEvent {
    // KilnError kept for internal use, but events carry strings
    pub fn job_failed(target_id: String, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            error: error.to_string(),
        }
    }
}
