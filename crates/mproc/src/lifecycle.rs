//! Server lifecycle: `Created → Running → Stopping → Stopped`.
//!
//! Transitions only move forward. Observers can block until a state is
//! reached.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Lifecycle {
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::Created),
            changed: Condvar::new(),
        }
    }

    pub fn current(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if it is ahead of the current state. Returns whether
    /// the state changed.
    pub fn transition(&self, next: ServerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next <= *state {
            return false;
        }
        tracing::info!(from = %*state, to = %next, "Server state changed");
        *state = next;
        self.changed.notify_all();
        true
    }

    /// Block until the state is at least `target`.
    pub fn wait_for(&self, target: ServerState) -> ServerState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .changed
            .wait_while(state, |s| *s < target)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    /// Like [`wait_for`](Self::wait_for) but gives up after `timeout`,
    /// returning whatever state was reached.
    pub fn wait_for_timeout(&self, target: ServerState, timeout: Duration) -> ServerState {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state < target {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            state = self
                .changed
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *state
    }
}

/// Notifications from server threads to the supervisor.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// A dispatcher thread returned.
    DispatcherExited { index: usize },
    /// Orderly stop, from a handle or a closed host channel.
    StopRequested { reason: String },
    /// Unrecoverable channel error.
    Fatal { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn transitions_only_move_forward() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition(ServerState::Running));
        assert!(lifecycle.transition(ServerState::Stopped));
        assert!(!lifecycle.transition(ServerState::Stopping));
        assert!(!lifecycle.transition(ServerState::Running));
        assert_eq!(lifecycle.current(), ServerState::Stopped);
    }

    #[test]
    fn states_are_ordered() {
        assert!(ServerState::Created < ServerState::Running);
        assert!(ServerState::Running < ServerState::Stopping);
        assert!(ServerState::Stopping < ServerState::Stopped);
    }

    #[test]
    fn wait_for_wakes_on_transition() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || lifecycle.wait_for(ServerState::Stopping))
        };

        lifecycle.transition(ServerState::Running);
        lifecycle.transition(ServerState::Stopped);
        assert_eq!(waiter.join().unwrap(), ServerState::Stopped);
    }

    #[test]
    fn wait_for_timeout_returns_current_state() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(ServerState::Running);
        let reached = lifecycle.wait_for_timeout(ServerState::Stopped, Duration::from_millis(20));
        assert_eq!(reached, ServerState::Running);
    }
}
