//! Backend action executor contract
//!
//! The protocol engine (IMAP/POP/SMTP) runs in a separate process and is
//! reachable only through an IPC-style channel. This module defines the
//! calling contract the agent relies on: three single-slot lanes, a
//! non-blocking `start`, a cooperative `cancel`, and an event channel that
//! carries progress plus exactly one terminal activity per started action.

use serde::{Deserialize, Serialize};

use crate::sync::action::{Action, Lane};
use crate::types::error::Result;
use crate::types::{ActionId, SyncError};

/// Failure codes reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    Network,
    Login,
    Timeout,
    DiskFull,
    Cancelled,
    Internal,
}

/// Activity of a lane's current action. The backend emits zero or more
/// `InProgress` reports, then exactly one terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    InProgress,
    Succeeded,
    Failed(BackendError),
}

impl Activity {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Activity::InProgress)
    }
}

/// Event emitted by the backend on the agent's inbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEvent {
    ActivityChanged {
        lane: Lane,
        action: ActionId,
        activity: Activity,
    },
    Progress {
        lane: Lane,
        action: ActionId,
        value: u32,
        total: u32,
    },
}

/// Map a backend failure to the client-facing error taxonomy. Cancellation
/// is a terminal state, not an error, and maps to `None`.
pub fn classify(error: BackendError) -> Option<SyncError> {
    match error {
        BackendError::Network | BackendError::Timeout | BackendError::Internal => {
            Some(SyncError::SyncFailed)
        }
        BackendError::Login => Some(SyncError::LoginFailed),
        BackendError::DiskFull => Some(SyncError::DiskFull),
        BackendError::Cancelled => None,
    }
}

/// Adapter to the external protocol engine.
///
/// Implementations hold one execution slot per [`Lane`] and report through
/// the [`BackendEvent`] channel handed to them at construction. The agent
/// guarantees it never starts a second action on a lane before the terminal
/// activity for the previous one arrived.
pub trait BackendExecutor: Send {
    /// Begin executing `action` on its lane. Must not block; completion is
    /// reported later on the event channel.
    fn start(&mut self, action: &Action) -> Result<()>;

    /// Request termination of the lane's current action. Cooperative: the
    /// backend still delivers a terminal activity for the action, either
    /// `Failed(Cancelled)` or a late `Succeeded` race, and either outcome
    /// frees the lane.
    fn cancel(&mut self, lane: Lane);
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory executor double recording calls and letting tests inject
    //! backend events.

    use std::sync::{Arc, Mutex};

    use flume::{Receiver, Sender};

    use super::*;

    #[derive(Default)]
    struct MockState {
        started: Vec<(Lane, ActionId)>,
        cancelled: Vec<Lane>,
        fail_start: bool,
    }

    pub(crate) struct MockExecutor {
        state: Arc<Mutex<MockState>>,
    }

    /// Test-side handle to the mock: inspects recorded calls and feeds
    /// events into the agent's backend channel.
    #[derive(Clone)]
    pub(crate) struct MockBackend {
        state: Arc<Mutex<MockState>>,
        events: Sender<BackendEvent>,
    }

    impl MockExecutor {
        pub fn new() -> (MockExecutor, MockBackend, Receiver<BackendEvent>) {
            let (tx, rx) = flume::unbounded();
            let state = Arc::new(Mutex::new(MockState::default()));
            (
                MockExecutor {
                    state: state.clone(),
                },
                MockBackend { state, events: tx },
                rx,
            )
        }
    }

    impl BackendExecutor for MockExecutor {
        fn start(&mut self, action: &Action) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_start {
                return Err(crate::types::error::AgentError::Backend(
                    "start rejected".to_string(),
                ));
            }
            state.started.push((action.lane(), action.id()));
            Ok(())
        }

        fn cancel(&mut self, lane: Lane) {
            self.state.lock().unwrap().cancelled.push(lane);
        }
    }

    impl MockBackend {
        pub fn starts(&self) -> Vec<(Lane, ActionId)> {
            self.state.lock().unwrap().started.clone()
        }

        pub fn cancels(&self) -> Vec<Lane> {
            self.state.lock().unwrap().cancelled.clone()
        }

        pub fn last_started(&self, lane: Lane) -> Option<ActionId> {
            self.state
                .lock()
                .unwrap()
                .started
                .iter()
                .rev()
                .find(|(l, _)| *l == lane)
                .map(|(_, id)| *id)
        }

        pub fn set_fail_start(&self, fail: bool) {
            self.state.lock().unwrap().fail_start = fail;
        }

        pub fn succeed(&self, lane: Lane, action: ActionId) {
            self.events
                .send(BackendEvent::ActivityChanged {
                    lane,
                    action,
                    activity: Activity::Succeeded,
                })
                .unwrap();
        }

        pub fn fail(&self, lane: Lane, action: ActionId, error: BackendError) {
            self.events
                .send(BackendEvent::ActivityChanged {
                    lane,
                    action,
                    activity: Activity::Failed(error),
                })
                .unwrap();
        }

        pub fn progress(&self, lane: Lane, action: ActionId, value: u32, total: u32) {
            self.events
                .send(BackendEvent::Progress {
                    lane,
                    action,
                    value,
                    total,
                })
                .unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify(BackendError::Network), Some(SyncError::SyncFailed));
        assert_eq!(classify(BackendError::Timeout), Some(SyncError::SyncFailed));
        assert_eq!(classify(BackendError::Login), Some(SyncError::LoginFailed));
        assert_eq!(classify(BackendError::DiskFull), Some(SyncError::DiskFull));
        assert_eq!(classify(BackendError::Cancelled), None);
    }

    #[test]
    fn test_terminal_activities() {
        assert!(!Activity::InProgress.is_terminal());
        assert!(Activity::Succeeded.is_terminal());
        assert!(Activity::Failed(BackendError::Network).is_terminal());
    }
}
