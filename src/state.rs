//! Session lifecycle states.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an engine is in its session lifecycle.
///
/// ```text
/// Created → Initialized → ParamExchange → Running → ResultExchange → Done
///                  └──────────────┴────────────┴────────────┴──→ Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestState {
    Created,
    Initialized,
    ParamExchange,
    Running,
    ResultExchange,
    Done,
    Error,
}

impl TestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TestState::Done | TestState::Error)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Any non-terminal state may fail into `Error`. A reset back to
    /// `Initialized` is handled by the engine and is not a transition.
    pub fn can_advance_to(self, next: TestState) -> bool {
        use TestState::*;
        match (self, next) {
            (Created, Initialized)
            | (Initialized, ParamExchange)
            | (ParamExchange, Running)
            | (Running, ResultExchange)
            | (ResultExchange, Done) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TestState::Created => "CREATED",
            TestState::Initialized => "INITIALIZED",
            TestState::ParamExchange => "PARAM_EXCHANGE",
            TestState::Running => "RUNNING",
            TestState::ResultExchange => "RESULT_EXCHANGE",
            TestState::Done => "DONE",
            TestState::Error => "ERROR",
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state plus the states visited since the last reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: TestState,
    visited: Vec<TestState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: TestState::Created,
            visited: vec![TestState::Created],
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn visited(&self) -> &[TestState] {
        &self.visited
    }

    pub fn advance(&mut self, next: TestState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidState(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }
        log::debug!("state {} -> {}", self.state, next);
        self.state = next;
        self.visited.push(next);
        Ok(())
    }

    /// Moves to `Error` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = TestState::Error;
            self.visited.push(TestState::Error);
        }
    }

    /// Starts a fresh session log at `Initialized`.
    pub fn reset(&mut self) {
        self.state = TestState::Initialized;
        self.visited = vec![TestState::Initialized];
    }
}
