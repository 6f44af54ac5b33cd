//! Connection state machine and its single serialized write point.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const TRANSITION_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    CredentialsMissing,
    CredentialsReady,
    Negotiating,
    EstablishingTransport,
    Connected,
    Disconnected,
    /// Absorbing: nothing leaves this state.
    Terminated,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the lifecycle graph. Resets and termination
    /// have their own entry points on [`StateCell`].
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (CredentialsMissing, CredentialsReady)
                | (CredentialsReady, Negotiating)
                | (Negotiating, EstablishingTransport)
                | (EstablishingTransport, Connected)
                | (EstablishingTransport, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, CredentialsMissing)
        ) || (self != Terminated && next == Terminated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("expected state {expected} before moving to {to}, found {actual}")]
    UnexpectedState {
        expected: ConnectionState,
        actual: ConnectionState,
        to: ConnectionState,
    },
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Shared handle to the one `ConnectionState` of a client.
///
/// Every write goes through the watch channel's serialized modify path, so engine tasks,
/// the stop signal and the lifecycle loop never interleave a transition.
#[derive(Clone)]
pub struct StateCell {
    state: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<Transition>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::CredentialsMissing);
        let (transitions, _) = broadcast::channel(TRANSITION_HISTORY);
        Self {
            state: Arc::new(state),
            transitions,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.get() == ConnectionState::Terminated
    }

    /// Moves `from -> to`, failing if the current state is not `from` or the edge is illegal.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), TransitionError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|current| {
            if *current != from {
                outcome = Err(TransitionError::UnexpectedState {
                    expected: from,
                    actual: *current,
                    to,
                });
                return false;
            }
            if !from.can_transition_to(to) {
                outcome = Err(TransitionError::Illegal { from, to });
                return false;
            }
            *current = to;
            true
        });
        if outcome.is_ok() {
            self.record(from, to);
        }
        outcome
    }

    /// Returns to `CredentialsMissing` from any live state. No-op once terminated.
    pub fn reset(&self) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| match *current {
            ConnectionState::Terminated => false,
            ConnectionState::CredentialsMissing => {
                from = Some(ConnectionState::CredentialsMissing);
                false
            }
            other => {
                from = Some(other);
                *current = ConnectionState::CredentialsMissing;
                true
            }
        });
        match from {
            Some(ConnectionState::CredentialsMissing) => true,
            Some(prev) => {
                self.record(prev, ConnectionState::CredentialsMissing);
                true
            }
            None => false,
        }
    }

    /// Forces `Terminated`. Returns false if it was already terminated.
    pub fn terminate(&self) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Terminated {
                return false;
            }
            from = Some(*current);
            *current = ConnectionState::Terminated;
            true
        });
        match from {
            Some(prev) => {
                self.record(prev, ConnectionState::Terminated);
                true
            }
            None => false,
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the state reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Terminated).await;
    }

    fn record(&self, from: ConnectionState, to: ConnectionState) {
        info!(%from, %to, "state changed");
        if self.transitions.send(Transition { from, to }).is_err() {
            debug!("no transition observers");
        }
    }
}
