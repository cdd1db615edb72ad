//! Cycle state machine types.
//!
//! - [`CycleState`] - where a cycle currently is
//! - [`Stage`] - which stage a failure belongs to
//! - [`CycleStatus`] - the overall verdict
//! - [`StateMachine`] - the current state plus its transition history

use crate::error::{QtcovError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Stage
// ============================================================================

/// A stage of the cycle that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Prompt,
    Generate,
    Save,
    Build,
    Test,
    Coverage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prompt => "prompt",
            Stage::Generate => "generate",
            Stage::Save => "save",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Coverage => "coverage",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Cycle State
// ============================================================================

/// Current state of a cycle.
///
/// # State Transitions
///
/// - `Idle` -> `PromptLoaded` -> `Generated` -> `Saved` -> `Built` ->
///   `Tested` -> `CoverageCollected` -> `Done`
/// - `Saved` -> `Done`: generation-only run
/// - `Tested` -> `Done`: coverage could not be collected
/// - `Built` -> `Remediating` -> `Retrying` -> `Tested`: one launch remediation
/// - any non-terminal state -> `Failed(stage)`
///
/// `Retrying` has no edge back to `Remediating`, so a cycle remediates at
/// most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CycleState {
    #[default]
    Idle,
    PromptLoaded,
    Generated,
    Saved,
    Built,
    Tested,
    CoverageCollected,
    Done,
    Failed(Stage),
    Remediating,
    Retrying,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleState::Idle => write!(f, "idle"),
            CycleState::PromptLoaded => write!(f, "prompt loaded"),
            CycleState::Generated => write!(f, "generated"),
            CycleState::Saved => write!(f, "saved"),
            CycleState::Built => write!(f, "built"),
            CycleState::Tested => write!(f, "tested"),
            CycleState::CoverageCollected => write!(f, "coverage collected"),
            CycleState::Done => write!(f, "done"),
            CycleState::Failed(stage) => write!(f, "failed ({})", stage),
            CycleState::Remediating => write!(f, "remediating"),
            CycleState::Retrying => write!(f, "retrying"),
        }
    }
}

impl CycleState {
    /// Check if this state can transition to the target state.
    ///
    /// # Example
    ///
    /// ```
    /// use qtcov::cycle::CycleState;
    ///
    /// assert!(CycleState::Built.can_transition_to(CycleState::Remediating));
    /// assert!(!CycleState::Retrying.can_transition_to(CycleState::Remediating));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Failed(_)) {
            return true;
        }
        matches!(
            (self, target),
            (Idle, PromptLoaded)
                | (PromptLoaded, Generated)
                | (Generated, Saved)
                | (Saved, Built)
                | (Saved, Done)
                | (Built, Tested)
                | (Built, Remediating)
                | (Remediating, Retrying)
                | (Retrying, Tested)
                | (Tested, CoverageCollected)
                | (Tested, Done)
                | (CoverageCollected, Done)
        )
    }

    /// `Done` and `Failed` absorb every further transition.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Done | CycleState::Failed(_))
    }
}

// ============================================================================
// Status
// ============================================================================

/// Overall verdict of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Success,
    Partial,
    Failed,
}

impl CycleStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            CycleStatus::Success => 0,
            CycleStatus::Failed => 1,
            CycleStatus::Partial => 2,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::Success => write!(f, "success"),
            CycleStatus::Partial => write!(f, "partial"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Record of one state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CycleState,
    pub to: CycleState,
    pub at: DateTime<Utc>,
}

/// Current state plus history; rejects transitions the graph does not have.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: CycleState,
    history: Vec<StateTransition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Move to `to`, returning the transition record.
    pub fn advance(&mut self, to: CycleState) -> Result<StateTransition> {
        if !self.state.can_transition_to(to) {
            return Err(QtcovError::Other(anyhow::anyhow!(
                "invalid cycle transition: {} -> {}",
                self.state,
                to
            )));
        }
        let transition = StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.history.push(transition.clone());
        Ok(transition)
    }
}
