//! Connection and ringing lifecycles
//!
//! Both are pure state logic. [`ConnectionLifecycle`] validates every
//! transition and publishes accepted ones; [`derive_ringing_state`] is a pure
//! function of accumulated ringing inputs and is re-run from scratch whenever
//! those inputs change.

use crate::events::{CallEvent, EventBus};
use crate::types::SessionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition not allowed from the current state
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: ConnectionState,
        /// Requested state
        to: ConnectionState,
    },
}

/// Connection lifecycle of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing attempted yet
    PreJoin,
    /// Join RPC or initial connect running
    InProgress,
    /// Joined the SFU with this session
    Joined {
        /// Session id
        session_id: SessionId,
    },
    /// Media flowing
    Connected,
    /// Fast reconnect or rejoin running
    Reconnecting,
    /// Moving to another SFU
    Migrating,
    /// Gave up
    Failed {
        /// Why
        cause: String,
    },
    /// Left the call
    Disconnected,
}

impl ConnectionState {
    /// `Failed` or `Disconnected`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Disconnected)
    }

    /// `Reconnecting` or `Migrating`
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Reconnecting | Self::Migrating)
    }
}

/// Check if a lifecycle transition is valid
///
/// Identical states are never a transition. `Failed` and `Disconnected`
/// only lead to a new join attempt.
#[must_use]
pub fn is_valid_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState as S;
    matches!(
        (from, to),
        (S::PreJoin, S::InProgress)
            | (S::PreJoin, S::Disconnected)
            // Join
            | (S::InProgress, S::Joined { .. })
            | (S::InProgress, S::Failed { .. })
            | (S::InProgress, S::Disconnected)
            | (S::Joined { .. }, S::Connected)
            | (S::Joined { .. }, S::Reconnecting)
            | (S::Joined { .. }, S::Migrating)
            | (S::Joined { .. }, S::Failed { .. })
            | (S::Joined { .. }, S::Disconnected)
            // Connected
            | (S::Connected, S::Reconnecting)
            | (S::Connected, S::Migrating)
            | (S::Connected, S::Failed { .. })
            | (S::Connected, S::Disconnected)
            // Transient states always resolve
            | (S::Reconnecting, S::Connected)
            | (S::Reconnecting, S::Migrating)
            | (S::Reconnecting, S::Failed { .. })
            | (S::Reconnecting, S::Disconnected)
            | (S::Migrating, S::Connected)
            | (S::Migrating, S::Failed { .. })
            | (S::Migrating, S::Disconnected)
            // A new attempt after a terminal state
            | (S::Failed { .. }, S::InProgress)
            | (S::Failed { .. }, S::Disconnected)
            | (S::Disconnected, S::InProgress)
    )
}

/// Single-writer connection lifecycle
///
/// Accepted transitions are published as [`CallEvent::ConnectionChanged`] in
/// the order they were applied.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: watch::Sender<ConnectionState>,
    order: Mutex<()>,
    events: EventBus,
}

impl ConnectionLifecycle {
    /// Start in `PreJoin`
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::PreJoin);
        Self {
            state,
            order: Mutex::new(()),
            events,
        }
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch the state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `to`
    ///
    /// Returns `Ok(false)` if already in `to`, so repeated requests for the
    /// same state never publish twice.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if `to` is not reachable
    pub fn transition(&self, to: ConnectionState) -> Result<bool, LifecycleError> {
        let _order = self.order.lock();
        let mut outcome = Ok(false);
        self.state.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            if !is_valid_transition(current, &to) {
                outcome = Err(LifecycleError::InvalidTransition {
                    from: current.clone(),
                    to: to.clone(),
                });
                return false;
            }
            *current = to.clone();
            outcome = Ok(true);
            true
        });

        if matches!(outcome, Ok(true)) {
            tracing::info!(state = ?to, "Connection state changed");
            self.events.emit(CallEvent::ConnectionChanged(to));
        }
        outcome
    }

    /// Enter `Reconnecting` unless already there; returns whether it entered
    pub fn enter_reconnecting(&self) -> bool {
        match self.transition(ConnectionState::Reconnecting) {
            Ok(entered) => entered,
            Err(e) => {
                tracing::debug!(error = %e, "Not entering reconnecting");
                false
            }
        }
    }

    /// Move to `Failed` from wherever possible
    pub fn fail(&self, cause: impl Into<String>) {
        let cause = cause.into();
        if let Err(e) = self.transition(ConnectionState::Failed { cause }) {
            tracing::warn!(error = %e, "Cannot fail from current state");
        }
    }
}

/// Ringing lifecycle of a call invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingingState {
    /// Not ringing
    Idle,
    /// Local user rings others
    Outgoing {
        /// Someone other than the local user accepted
        accepted_by_callee: bool,
    },
    /// Others ring the local user
    Incoming {
        /// The local user accepted
        accepted_by_me: bool,
    },
    /// Local user is in the call
    Active,
    /// Everyone declined, or the caller cancelled
    RejectedByAll,
    /// Auto-cancel deadline passed without an answer
    TimeoutNoAnswer,
}

/// Everything the ringing state is derived from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingingInputs {
    /// Local user
    pub local_user_id: String,
    /// Creator of the call
    pub created_by: String,
    /// Call members, including the local user
    pub members: BTreeSet<String>,
    /// The call is ringing
    pub ringing: bool,
    /// Users who accepted
    pub accepted_by: BTreeSet<String>,
    /// Users who rejected
    pub rejected_by: BTreeSet<String>,
    /// Users currently joined as participants
    pub participants: BTreeSet<String>,
    /// The auto-cancel deadline elapsed
    pub auto_cancel_elapsed: bool,
}

/// Derive the ringing state from scratch
///
/// A user present in both `accepted_by` and `rejected_by` counts as accepted,
/// which keeps the result independent of event order.
#[must_use]
pub fn derive_ringing_state(inputs: &RingingInputs) -> RingingState {
    let me = inputs.local_user_id.as_str();
    if inputs.participants.contains(me) {
        return RingingState::Active;
    }
    if !inputs.ringing {
        return RingingState::Idle;
    }

    let rejected: BTreeSet<&str> = inputs
        .rejected_by
        .iter()
        .filter(|u| !inputs.accepted_by.contains(*u))
        .map(String::as_str)
        .collect();
    let others: Vec<&str> = inputs
        .members
        .iter()
        .map(String::as_str)
        .filter(|u| *u != me)
        .collect();
    let all_others_rejected = !others.is_empty() && others.iter().all(|u| rejected.contains(u));

    if inputs.created_by == me {
        if all_others_rejected {
            return RingingState::RejectedByAll;
        }
        let accepted_by_callee = inputs.accepted_by.iter().any(|u| u != me);
        if !accepted_by_callee && inputs.auto_cancel_elapsed {
            return RingingState::TimeoutNoAnswer;
        }
        RingingState::Outgoing { accepted_by_callee }
    } else {
        // the caller rejecting its own call is a cancel
        if all_others_rejected || rejected.contains(inputs.created_by.as_str()) {
            return RingingState::RejectedByAll;
        }
        if rejected.contains(me) {
            return RingingState::Idle;
        }
        let accepted_by_me = inputs.accepted_by.contains(me);
        if !accepted_by_me && inputs.auto_cancel_elapsed {
            return RingingState::TimeoutNoAnswer;
        }
        RingingState::Incoming { accepted_by_me }
    }
}

/// Event feeding the ringing tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingingEvent {
    /// A ringing call was created
    Ring {
        /// Creator
        created_by: String,
        /// Members
        members: Vec<String>,
    },
    /// A member accepted
    Accepted {
        /// User
        user_id: String,
    },
    /// A member rejected
    Rejected {
        /// User
        user_id: String,
    },
    /// A user joined the call session
    ParticipantJoined {
        /// User
        user_id: String,
    },
    /// A user left the call session
    ParticipantLeft {
        /// User
        user_id: String,
    },
    /// Auto-cancel deadline elapsed
    AutoCancelElapsed,
    /// Ringing stopped (call ended or answered elsewhere)
    RingingEnded,
}

/// Accumulates ringing inputs and re-derives the state
///
/// The last inputs are cached; an event that leaves them unchanged skips the
/// derivation. Every change re-derives from scratch.
#[derive(Debug, Clone)]
pub struct RingingTracker {
    inputs: RingingInputs,
    state: RingingState,
}

impl RingingTracker {
    /// Tracker for the given local user
    #[must_use]
    pub fn new(local_user_id: impl Into<String>) -> Self {
        let inputs = RingingInputs {
            local_user_id: local_user_id.into(),
            ..RingingInputs::default()
        };
        let state = derive_ringing_state(&inputs);
        Self { inputs, state }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> &RingingState {
        &self.state
    }

    /// Accumulated inputs
    #[must_use]
    pub fn inputs(&self) -> &RingingInputs {
        &self.inputs
    }

    /// Apply an event; returns the new state if it changed
    pub fn apply(&mut self, event: RingingEvent) -> Option<RingingState> {
        let mut next = self.inputs.clone();
        match event {
            RingingEvent::Ring {
                created_by,
                members,
            } => {
                next.created_by = created_by;
                next.members = members.into_iter().collect();
                next.ringing = true;
            }
            RingingEvent::Accepted { user_id } => {
                next.accepted_by.insert(user_id);
            }
            RingingEvent::Rejected { user_id } => {
                next.rejected_by.insert(user_id);
            }
            RingingEvent::ParticipantJoined { user_id } => {
                next.participants.insert(user_id);
            }
            RingingEvent::ParticipantLeft { user_id } => {
                next.participants.remove(&user_id);
            }
            RingingEvent::AutoCancelElapsed => next.auto_cancel_elapsed = true,
            RingingEvent::RingingEnded => next.ringing = false,
        }

        if next == self.inputs {
            return None;
        }
        self.inputs = next;
        let state = derive_ringing_state(&self.inputs);
        if state == self.state {
            return None;
        }
        tracing::info!(from = ?self.state, to = ?state, "Ringing state changed");
        self.state = state.clone();
        Some(state)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outgoing_tracker() -> RingingTracker {
        let mut tracker = RingingTracker::new("me");
        tracker.apply(RingingEvent::Ring {
            created_by: "me".into(),
            members: vec!["me".into(), "a".into(), "b".into()],
        });
        tracker
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let lifecycle = ConnectionLifecycle::new(events);

        lifecycle.transition(ConnectionState::InProgress).unwrap();
        lifecycle
            .transition(ConnectionState::Joined {
                session_id: SessionId::from("s1"),
            })
            .unwrap();
        lifecycle.transition(ConnectionState::Connected).unwrap();

        assert_eq!(lifecycle.current(), ConnectionState::Connected);
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::ConnectionChanged(ConnectionState::InProgress)
        );
    }

    #[test]
    fn test_reconnecting_enters_once() {
        let lifecycle = ConnectionLifecycle::new(EventBus::new(16));
        let mut rx = lifecycle.events.subscribe();
        lifecycle.transition(ConnectionState::InProgress).unwrap();
        lifecycle
            .transition(ConnectionState::Joined {
                session_id: SessionId::from("s1"),
            })
            .unwrap();
        lifecycle.transition(ConnectionState::Connected).unwrap();

        assert!(lifecycle.enter_reconnecting());
        assert!(!lifecycle.enter_reconnecting());

        let mut reconnecting = 0;
        while let Ok(event) = rx.try_recv() {
            if event == CallEvent::ConnectionChanged(ConnectionState::Reconnecting) {
                reconnecting += 1;
            }
        }
        assert_eq!(reconnecting, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(
            &ConnectionState::Reconnecting,
            &ConnectionState::Reconnecting
        ));
        assert!(!is_valid_transition(
            &ConnectionState::Migrating,
            &ConnectionState::Reconnecting
        ));
        assert!(!is_valid_transition(
            &ConnectionState::PreJoin,
            &ConnectionState::Connected
        ));
        assert!(is_valid_transition(
            &ConnectionState::Disconnected,
            &ConnectionState::InProgress
        ));

        let lifecycle = ConnectionLifecycle::new(EventBus::new(4));
        let err = lifecycle
            .transition(ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(lifecycle.current(), ConnectionState::PreJoin);
    }

    #[test]
    fn test_outgoing_scenario() {
        let mut tracker = outgoing_tracker();
        assert_eq!(
            tracker.state(),
            &RingingState::Outgoing {
                accepted_by_callee: false
            }
        );

        let state = tracker.apply(RingingEvent::Accepted { user_id: "a".into() });
        assert_eq!(
            state,
            Some(RingingState::Outgoing {
                accepted_by_callee: true
            })
        );

        let state = tracker.apply(RingingEvent::ParticipantJoined {
            user_id: "me".into(),
        });
        assert_eq!(state, Some(RingingState::Active));
    }

    #[test]
    fn test_outgoing_rejected_by_all() {
        let mut tracker = outgoing_tracker();
        tracker.apply(RingingEvent::Rejected { user_id: "a".into() });
        assert_eq!(
            tracker.apply(RingingEvent::Rejected { user_id: "b".into() }),
            Some(RingingState::RejectedByAll)
        );
    }

    #[test]
    fn test_outgoing_timeout() {
        let mut tracker = outgoing_tracker();
        assert_eq!(
            tracker.apply(RingingEvent::AutoCancelElapsed),
            Some(RingingState::TimeoutNoAnswer)
        );
    }

    #[test]
    fn test_incoming() {
        let mut tracker = RingingTracker::new("me");
        tracker.apply(RingingEvent::Ring {
            created_by: "caller".into(),
            members: vec!["caller".into(), "me".into()],
        });
        assert_eq!(
            tracker.state(),
            &RingingState::Incoming {
                accepted_by_me: false
            }
        );
        assert_eq!(
            tracker.apply(RingingEvent::Accepted {
                user_id: "me".into()
            }),
            Some(RingingState::Incoming {
                accepted_by_me: true
            })
        );
        // accepted calls do not time out
        assert_eq!(tracker.apply(RingingEvent::AutoCancelElapsed), None);
    }

    #[test]
    fn test_incoming_cancelled_by_caller() {
        let mut tracker = RingingTracker::new("me");
        tracker.apply(RingingEvent::Ring {
            created_by: "caller".into(),
            members: vec!["caller".into(), "me".into(), "x".into()],
        });
        assert_eq!(
            tracker.apply(RingingEvent::Rejected {
                user_id: "caller".into()
            }),
            Some(RingingState::RejectedByAll)
        );
    }

    #[test]
    fn test_unchanged_inputs_skip_derivation() {
        let mut tracker = outgoing_tracker();
        assert!(tracker
            .apply(RingingEvent::Accepted { user_id: "a".into() })
            .is_some());
        assert!(tracker
            .apply(RingingEvent::Accepted { user_id: "a".into() })
            .is_none());
    }

    #[test]
    fn test_not_ringing_is_idle() {
        let tracker = RingingTracker::new("me");
        assert_eq!(tracker.state(), &RingingState::Idle);
    }
}
