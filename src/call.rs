//! Call-mode overlay
//!
//! A small reducer layered over the session machine for dialed sessions.
//! It owns only the call lifecycle; everything it wants from the session
//! machine it requests by emitting ordinary session events, so the session
//! reducer stays the single authority over recording state.

use uuid::Uuid;

use crate::session;

/// Externally visible call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub enum CallState {
    Idle,
    Connecting { call_id: Uuid, number: String },
    Active { call_id: Uuid, number: String },
    Ended { call_id: Uuid },
}

impl Default for CallState {
    fn default() -> Self {
        CallState::Idle
    }
}

impl CallState {
    pub fn status(&self) -> CallStatus {
        match self {
            CallState::Idle => CallStatus::Idle,
            CallState::Connecting { .. } => CallStatus::Connecting,
            CallState::Active { .. } => CallStatus::Active,
            CallState::Ended { .. } => CallStatus::Ended,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    Dial { number: String },
    /// Connect delay elapsed. Carries the loop clock so the session start
    /// it triggers is stamped consistently.
    ConnectTimer { id: Uuid, now_ms: u64 },
    HangUp { at_ms: u64 },
}

#[derive(Debug, Clone)]
pub enum CallEffect {
    StartConnectTimer { id: Uuid },
    /// Forwarded into the session machine in the same loop iteration.
    Session(session::Event),
    EmitStatus,
}

/// Reducer for the call overlay. Stale connect timers (from a superseded
/// dial) are dropped by id.
pub fn reduce_call(state: &CallState, event: CallEvent) -> (CallState, Vec<CallEffect>) {
    use CallEffect::*;
    use CallEvent::*;
    use CallState::*;

    match (state, event) {
        (Idle, Dial { number }) | (Ended { .. }, Dial { number }) => {
            let id = Uuid::new_v4();
            log::info!("Dialing {}", number);
            (
                Connecting { call_id: id, number },
                vec![StartConnectTimer { id }, EmitStatus],
            )
        }

        (Connecting { call_id, number }, ConnectTimer { id, now_ms }) if *call_id == id => {
            log::info!("Call connected: {}", number);
            (
                Active { call_id: *call_id, number: number.clone() },
                vec![
                    Session(session::Event::CallConnected { number: number.clone() }),
                    Session(session::Event::Start { at_ms: now_ms }),
                    EmitStatus,
                ],
            )
        }

        // Hang-up before connect abandons the dial; the pending timer is
        // orphaned and will be dropped as stale.
        (Connecting { call_id, .. }, HangUp { .. }) => (
            Ended { call_id: *call_id },
            vec![EmitStatus],
        ),

        (Active { call_id, .. }, HangUp { at_ms }) => (
            Ended { call_id: *call_id },
            vec![Session(session::Event::Stop { at_ms }), EmitStatus],
        ),

        (_, event) => {
            log::debug!("Ignoring call event in current state: {:?}", event);
            (state.clone(), vec![])
        }
    }
}
