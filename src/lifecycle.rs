//! Engine lifecycle state machine: `Idle -> Running -> Stopped`.
//!
//! The state sits behind its own mutex and is only reachable through these accessors. A
//! stopped engine stays stopped; starting it again is an error.

use crate::error::DispatchError;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Created, timers and handlers may be registered, no threads yet.
    Idle,
    Running,
    /// Terminal.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<EngineState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == EngineState::Stopped
    }

    /// Transition `Idle -> Running`.
    ///
    /// # Errors
    /// [`DispatchError::AlreadyRunning`] or [`DispatchError::Stopped`] from any other state.
    pub fn begin(&self) -> Result<(), DispatchError> {
        self.begin_with(|| Ok(()))
    }

    /// Transition `Idle -> Running` once `launch` has succeeded, holding the state lock
    /// throughout so a concurrent [`Lifecycle::finish`] either precedes the launch or sees
    /// everything it set up.
    ///
    /// # Arguments
    /// * `launch` - brings up whatever must exist before the state reads `Running`
    ///
    /// # Returns
    /// `Ok(())` in `Running`. If `launch` fails the state becomes `Stopped` and its error is
    /// returned.
    ///
    /// # Errors
    /// [`DispatchError::AlreadyRunning`] or [`DispatchError::Stopped`] from any state other
    /// than `Idle`; `launch` is not called then.
    pub fn begin_with<F>(&self, launch: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), DispatchError>,
    {
        let mut state = self.state.lock();
        match *state {
            EngineState::Idle => {}
            EngineState::Running => return Err(DispatchError::AlreadyRunning),
            EngineState::Stopped => return Err(DispatchError::Stopped),
        }
        match launch() {
            Ok(()) => {
                *state = EngineState::Running;
                Ok(())
            }
            Err(err) => {
                *state = EngineState::Stopped;
                Err(err)
            }
        }
    }

    /// Move to `Stopped`. Returns the previous state, or `None` if already stopped.
    pub fn finish(&self) -> Option<EngineState> {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == EngineState::Stopped {
            return None;
        }
        *state = EngineState::Stopped;
        Some(previous)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
