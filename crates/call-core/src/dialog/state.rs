//! Dialog lifecycle states
//!
//! ```text
//! Idle ──place──► Dialing ──2xx──► Established ──terminate──► Terminating ──BYE sent──► Closed
//!                    │
//!                    └──non-2xx / timeout / transport error / stop──► Failed
//! ```
//!
//! `Closed` and `Failed` are absorbing: once there, every further transition
//! is refused, which is what keeps a late response from resurrecting a
//! timed-out attempt.

use std::fmt;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::events::CallEvent;

/// State of one outbound dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Request built, nothing sent
    Idle,
    /// INVITE sent, waiting for a final response
    Dialing,
    /// 2xx received
    Established,
    /// BYE being sent
    Terminating,
    /// Dialog torn down
    Closed,
    /// Attempt ended without a dialog
    Failed,
}

impl DialogState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: DialogState) -> bool {
        use DialogState::*;
        matches!(
            (self, next),
            (Idle, Dialing)
                | (Dialing, Established)
                | (Dialing, Failed)
                | (Established, Terminating)
                | (Terminating, Closed)
        )
    }

    /// `Closed` or `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, DialogState::Closed | DialogState::Failed)
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialogState::Idle => "Idle",
            DialogState::Dialing => "Dialing",
            DialogState::Established => "Established",
            DialogState::Terminating => "Terminating",
            DialogState::Closed => "Closed",
            DialogState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Single-writer state cell shared by the controller and the dialog handle
#[derive(Debug)]
pub(crate) struct DialogStateCell {
    call_id: String,
    state: Mutex<DialogState>,
    events: broadcast::Sender<CallEvent>,
}

impl DialogStateCell {
    pub(crate) fn new(call_id: impl Into<String>, events: broadcast::Sender<CallEvent>) -> Self {
        Self {
            call_id: call_id.into(),
            state: Mutex::new(DialogState::Idle),
            events,
        }
    }

    pub(crate) fn get(&self) -> DialogState {
        *self.state.lock()
    }

    /// Move to `next` if legal; returns whether the transition happened
    pub(crate) fn transition(&self, next: DialogState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                trace!(call_id = %self.call_id, from = %*state, to = %next, "Transition refused");
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        debug!(call_id = %self.call_id, from = %previous, to = %next, "Dialog state changed");
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: self.call_id.clone(),
            previous,
            current: next,
            timestamp: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    const ALL: [DialogState; 6] = [
        DialogState::Idle,
        DialogState::Dialing,
        DialogState::Established,
        DialogState::Terminating,
        DialogState::Closed,
        DialogState::Failed,
    ];

    #[test]
    fn test_terminal_states_are_absorbing() {
        for next in ALL {
            assert!(!DialogState::Closed.can_transition_to(next));
            assert!(!DialogState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_shortcut_from_established_to_closed() {
        assert!(!DialogState::Established.can_transition_to(DialogState::Closed));
        assert!(!DialogState::Established.can_transition_to(DialogState::Failed));
        assert!(!DialogState::Idle.can_transition_to(DialogState::Established));
    }

    #[test]
    fn test_cell_refuses_resurrection() {
        let (events, mut rx) = event_channel();
        let cell = DialogStateCell::new("call-1", events);

        assert!(cell.transition(DialogState::Dialing));
        assert!(cell.transition(DialogState::Failed));
        assert!(!cell.transition(DialogState::Established));
        assert_eq!(cell.get(), DialogState::Failed);

        // Only the two accepted transitions were published
        let mut published = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, CallEvent::StateChanged { .. }));
            published += 1;
        }
        assert_eq!(published, 2);
    }
}
