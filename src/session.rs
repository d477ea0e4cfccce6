//! Recording session state machine
//!
//! Single-writer reducer for the session lifecycle. All transitions go
//! through `reduce()`, which returns the next state plus effects for the
//! runner to execute. Completion events carry the session id they belong
//! to; events from a superseded session are dropped by the stale guard.
//!
//! Timestamps are milliseconds since the pipeline epoch, stamped by the
//! event loop, so elapsed accounting is deterministic under test clocks.

use std::sync::Arc;

use uuid::Uuid;

use crate::audio::devices::DeviceDescriptor;
use crate::audio::encoder::CapturedArtifact;
use crate::persist::{DurabilityStatus, UploadMeta};

/// What kind of session is being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    InPerson,
    Call,
}

/// How call audio reaches the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallMethod {
    Speakerphone,
    DirectLine,
}

/// Human-readable capture-mode label used in upload metadata.
pub fn mode_label(mode: Mode, call_method: Option<CallMethod>) -> &'static str {
    match (mode, call_method) {
        (Mode::InPerson, _) => "In-Person",
        (Mode::Call, Some(CallMethod::DirectLine)) => "Direct Line",
        (Mode::Call, _) => "Speakerphone",
    }
}

/// Terminal failure causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    NoDevice,
    NoSupportedEncoding,
    DeviceUnavailable,
    Capture(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PermissionDenied => write!(f, "Microphone permission denied"),
            FailureReason::NoDevice => write!(f, "No audio input device available"),
            FailureReason::NoSupportedEncoding => {
                write!(f, "No supported recording encoding")
            }
            FailureReason::DeviceUnavailable => {
                write!(f, "Audio input device disappeared and no fallback exists")
            }
            FailureReason::Capture(e) => write!(f, "Capture failed: {}", e),
        }
    }
}

/// Identity and metadata of one session, carried through every active state.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub session_id: Uuid,
    pub mode: Mode,
    pub call_method: Option<CallMethod>,
    pub title: String,
    /// Bound input device, confirmed by `ArmOk`/`SourceBound`.
    pub device_id: Option<String>,
    /// Negotiated container mime type, known after arming.
    pub mime_type: Option<String>,
    /// Dialed number, set by the call overlay on connect.
    pub call_number: Option<String>,
}

pub const DEFAULT_TITLE: &str = "New Session";

#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Arming {
        session: SessionCtx,
        /// Stop arrived before arming completed; honored on `ArmOk`.
        stop_requested: bool,
        /// Start arrived before arming completed (its loop-clock stamp is
        /// kept for elapsed accounting); honored on `ArmOk` unless a stop
        /// was also latched. Covers dialed calls connecting faster than
        /// the hardware comes up.
        start_requested: Option<u64>,
    },
    Armed {
        session: SessionCtx,
    },
    Recording {
        session: SessionCtx,
        started_at_ms: u64,
        accumulated_paused_ms: u64,
    },
    Paused {
        session: SessionCtx,
        started_at_ms: u64,
        accumulated_paused_ms: u64,
        paused_at_ms: u64,
    },
    Finalizing {
        session: SessionCtx,
        duration_seconds: u32,
    },
    Completed {
        session: SessionCtx,
        artifact: Arc<CapturedArtifact>,
        /// None while persistence is in flight.
        durability: Option<DurabilityStatus>,
    },
    Failed {
        reason: FailureReason,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    // User operations, stamped by the event loop.
    Arm {
        mode: Mode,
        call_method: Option<CallMethod>,
        device_id: Option<String>,
        title: Option<String>,
    },
    Start {
        at_ms: u64,
    },
    Pause {
        at_ms: u64,
    },
    Resume {
        at_ms: u64,
    },
    Stop {
        at_ms: u64,
    },
    SwitchDevice {
        device_id: String,
    },
    /// Emitted by the call overlay when the dialed call goes active.
    CallConnected {
        number: String,
    },

    // Async completions from the effect runner.
    ArmOk {
        id: Uuid,
        device_id: String,
        mime_type: String,
    },
    ArmFail {
        id: Uuid,
        reason: FailureReason,
    },
    SourceBound {
        id: Uuid,
        device_id: String,
    },
    BindFailed {
        id: Uuid,
        reason: FailureReason,
    },
    FinalizeReady {
        id: Uuid,
        artifact: CapturedArtifact,
    },
    EncoderFailed {
        id: Uuid,
        err: String,
    },
    PersistDone {
        id: Uuid,
        status: DurabilityStatus,
    },

    // Timers and watchers.
    ElapsedTick {
        id: Uuid,
        now_ms: u64,
    },
    DeviceSetChanged {
        devices: Vec<DeviceDescriptor>,
    },
}

#[derive(Debug, Clone)]
pub enum Effect {
    /// Request permission, resolve the device, probe encodings, build the
    /// graph, and bind the input. Answers `ArmOk`/`ArmFail`.
    AcquireInput {
        id: Uuid,
        mode: Mode,
        device_id: Option<String>,
    },
    /// Rebind the graph input to a specific device. Answers
    /// `SourceBound`/`BindFailed`.
    BindSource {
        id: Uuid,
        device_id: String,
    },
    /// Rebind to the host default after device loss.
    BindFallback {
        id: Uuid,
    },
    StartEncoder {
        id: Uuid,
    },
    PauseEncoder {
        id: Uuid,
    },
    ResumeEncoder {
        id: Uuid,
    },
    /// Finalize the encoder. Answers `FinalizeReady` (synthesizing an empty
    /// artifact if the encoder never started) or `EncoderFailed`.
    StopEncoder {
        id: Uuid,
        duration_seconds: u32,
    },
    SuspendGraph,
    ResumeGraph,
    StartElapsedTick {
        id: Uuid,
    },
    /// Drop the session from the runner's active set, stopping its tasks.
    ReleaseSession {
        id: Uuid,
    },
    Persist {
        id: Uuid,
        artifact: Arc<CapturedArtifact>,
        meta: UploadMeta,
    },

    // Handled at the loop edge: forwarded to pipeline subscribers.
    EmitState,
    EmitElapsed {
        seconds: u64,
    },
    EmitFinalized {
        artifact: Arc<CapturedArtifact>,
        status: DurabilityStatus,
    },
    EmitFailed {
        reason: FailureReason,
    },
    EmitDevices {
        devices: Vec<DeviceDescriptor>,
    },
}

fn current_id(state: &State) -> Option<Uuid> {
    match state {
        State::Idle | State::Failed { .. } => None,
        State::Arming { session, .. }
        | State::Armed { session }
        | State::Recording { session, .. }
        | State::Paused { session, .. }
        | State::Finalizing { session, .. }
        | State::Completed { session, .. } => Some(session.session_id),
    }
}

/// Upload metadata for a finished session. Direct-line sessions carry the
/// dialed number in the title.
fn upload_meta(session: &SessionCtx, duration_seconds: u32) -> UploadMeta {
    let label = mode_label(session.mode, session.call_method);
    let title = match (&session.call_method, &session.call_number) {
        (Some(CallMethod::DirectLine), Some(number)) => {
            format!("{} ({})", session.title, number)
        }
        _ => session.title.clone(),
    };
    UploadMeta {
        title,
        mode_label: label.to_string(),
        tags: vec!["Live Capture".to_string(), label.to_string()],
        duration_seconds,
    }
}

fn device_present(devices: &[DeviceDescriptor], device_id: &Option<String>) -> bool {
    match device_id {
        Some(id) => devices.iter().any(|d| &d.device_id == id),
        None => true,
    }
}

/// Reducer: (state, event) -> (next_state, effects).
///
/// Rules:
/// - never mutate state in place
/// - drop completion events whose id does not match the live session
/// - finalize exactly once; repeated `Stop`/`FinalizeReady` are no-ops
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let live = current_id(state);
    let is_stale = |eid: Uuid| Some(eid) != live;

    match (state, event) {
        // -----------------
        // Arm: allowed from any settled state
        // -----------------
        (Idle, Arm { mode, call_method, device_id, title })
        | (Completed { .. }, Arm { mode, call_method, device_id, title })
        | (Failed { .. }, Arm { mode, call_method, device_id, title }) => {
            let id = Uuid::new_v4();
            let session = SessionCtx {
                session_id: id,
                mode,
                call_method,
                title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                device_id: device_id.clone(),
                mime_type: None,
                call_number: None,
            };
            (
                Arming { session, stop_requested: false, start_requested: None },
                vec![AcquireInput { id, mode, device_id }, EmitState],
            )
        }

        // Start without a prior arm: arm a default session and latch the
        // start so recording begins as soon as the hardware is up.
        (Idle, Start { at_ms }) => {
            let id = Uuid::new_v4();
            let session = SessionCtx {
                session_id: id,
                mode: Mode::InPerson,
                call_method: None,
                title: DEFAULT_TITLE.to_string(),
                device_id: None,
                mime_type: None,
                call_number: None,
            };
            (
                Arming {
                    session,
                    stop_requested: false,
                    start_requested: Some(at_ms),
                },
                vec![
                    AcquireInput { id, mode: Mode::InPerson, device_id: None },
                    EmitState,
                ],
            )
        }

        // A call connecting without a prior arm arms a call session; the
        // overlay's Start follows in the same loop iteration and latches.
        (Idle, CallConnected { number }) => {
            let id = Uuid::new_v4();
            let session = SessionCtx {
                session_id: id,
                mode: Mode::Call,
                call_method: None,
                title: DEFAULT_TITLE.to_string(),
                device_id: None,
                mime_type: None,
                call_number: Some(number),
            };
            (
                Arming { session, stop_requested: false, start_requested: None },
                vec![
                    AcquireInput { id, mode: Mode::Call, device_id: None },
                    EmitState,
                ],
            )
        }

        // -----------------
        // Arming
        // -----------------
        (
            Arming { session, stop_requested, start_requested },
            ArmOk { id, device_id, mime_type },
        ) if !is_stale(id) => {
            let mut session = session.clone();
            session.device_id = Some(device_id);
            session.mime_type = Some(mime_type);
            if *stop_requested {
                // The user stopped before the hardware came up. Finalize
                // immediately; the runner answers with an empty artifact.
                (
                    Finalizing { session, duration_seconds: 0 },
                    vec![StopEncoder { id, duration_seconds: 0 }, EmitState],
                )
            } else if let Some(at_ms) = start_requested {
                (
                    Recording {
                        session,
                        started_at_ms: *at_ms,
                        accumulated_paused_ms: 0,
                    },
                    vec![
                        StartEncoder { id },
                        ResumeGraph,
                        StartElapsedTick { id },
                        EmitState,
                    ],
                )
            } else {
                (Armed { session }, vec![EmitState])
            }
        }
        (Arming { .. }, ArmFail { id, reason }) if !is_stale(id) => (
            Failed { reason: reason.clone() },
            vec![ReleaseSession { id }, EmitFailed { reason }, EmitState],
        ),
        (Arming { session, start_requested, .. }, Stop { .. }) => (
            Arming {
                session: session.clone(),
                stop_requested: true,
                start_requested: *start_requested,
            },
            vec![],
        ),
        (Arming { session, stop_requested, .. }, Start { at_ms }) => (
            Arming {
                session: session.clone(),
                stop_requested: *stop_requested,
                start_requested: Some(at_ms),
            },
            vec![],
        ),

        // -----------------
        // Armed
        // -----------------
        (Armed { session }, Start { at_ms }) => {
            let id = session.session_id;
            (
                Recording {
                    session: session.clone(),
                    started_at_ms: at_ms,
                    accumulated_paused_ms: 0,
                },
                vec![
                    StartEncoder { id },
                    ResumeGraph,
                    StartElapsedTick { id },
                    EmitState,
                ],
            )
        }
        (Armed { session }, Stop { .. }) => {
            let id = session.session_id;
            (
                Finalizing { session: session.clone(), duration_seconds: 0 },
                vec![StopEncoder { id, duration_seconds: 0 }, EmitState],
            )
        }

        // -----------------
        // Recording
        // -----------------
        (Recording { session, started_at_ms, accumulated_paused_ms }, Pause { at_ms }) => {
            let id = session.session_id;
            (
                Paused {
                    session: session.clone(),
                    started_at_ms: *started_at_ms,
                    accumulated_paused_ms: *accumulated_paused_ms,
                    paused_at_ms: at_ms,
                },
                vec![PauseEncoder { id }, SuspendGraph, EmitState],
            )
        }
        (Recording { session, started_at_ms, accumulated_paused_ms }, Stop { at_ms }) => {
            let id = session.session_id;
            let elapsed_ms = at_ms.saturating_sub(*started_at_ms + *accumulated_paused_ms);
            let duration_seconds = (elapsed_ms / 1000) as u32;
            (
                Finalizing { session: session.clone(), duration_seconds },
                vec![StopEncoder { id, duration_seconds }, EmitState],
            )
        }
        (
            Recording { started_at_ms, accumulated_paused_ms, .. },
            ElapsedTick { id, now_ms },
        ) if !is_stale(id) => {
            let elapsed_ms = now_ms.saturating_sub(*started_at_ms + *accumulated_paused_ms);
            (state.clone(), vec![EmitElapsed { seconds: elapsed_ms / 1000 }])
        }

        // -----------------
        // Paused
        // -----------------
        (
            Paused { session, started_at_ms, accumulated_paused_ms, paused_at_ms },
            Resume { at_ms },
        ) => {
            let id = session.session_id;
            let paused_for = at_ms.saturating_sub(*paused_at_ms);
            (
                Recording {
                    session: session.clone(),
                    started_at_ms: *started_at_ms,
                    accumulated_paused_ms: accumulated_paused_ms + paused_for,
                },
                vec![ResumeEncoder { id }, ResumeGraph, EmitState],
            )
        }
        (
            Paused { session, started_at_ms, accumulated_paused_ms, paused_at_ms },
            Stop { .. },
        ) => {
            let id = session.session_id;
            // Elapsed froze at the pause point.
            let elapsed_ms =
                paused_at_ms.saturating_sub(*started_at_ms + *accumulated_paused_ms);
            let duration_seconds = (elapsed_ms / 1000) as u32;
            (
                Finalizing { session: session.clone(), duration_seconds },
                vec![StopEncoder { id, duration_seconds }, ResumeGraph, EmitState],
            )
        }
        // No elapsed progress while paused.
        (Paused { .. }, ElapsedTick { .. }) => (state.clone(), vec![]),

        // -----------------
        // Device rebinding (never resets sequence or elapsed)
        // -----------------
        (Armed { session }, SwitchDevice { device_id })
        | (Recording { session, .. }, SwitchDevice { device_id })
        | (Paused { session, .. }, SwitchDevice { device_id }) => {
            let id = session.session_id;
            (state.clone(), vec![BindSource { id, device_id }])
        }
        (Armed { session }, SourceBound { id, device_id })
            if !is_stale(id) =>
        {
            let mut session = session.clone();
            session.device_id = Some(device_id);
            (Armed { session }, vec![])
        }
        (Recording { session, started_at_ms, accumulated_paused_ms }, SourceBound { id, device_id })
            if !is_stale(id) =>
        {
            let mut session = session.clone();
            session.device_id = Some(device_id);
            (
                Recording {
                    session,
                    started_at_ms: *started_at_ms,
                    accumulated_paused_ms: *accumulated_paused_ms,
                },
                vec![],
            )
        }
        (
            Paused { session, started_at_ms, accumulated_paused_ms, paused_at_ms },
            SourceBound { id, device_id },
        ) if !is_stale(id) => {
            let mut session = session.clone();
            session.device_id = Some(device_id);
            (
                Paused {
                    session,
                    started_at_ms: *started_at_ms,
                    accumulated_paused_ms: *accumulated_paused_ms,
                    paused_at_ms: *paused_at_ms,
                },
                vec![],
            )
        }
        (Armed { .. }, BindFailed { id, reason })
        | (Recording { .. }, BindFailed { id, reason })
        | (Paused { .. }, BindFailed { id, reason })
            if !is_stale(id) =>
        {
            (
                Failed { reason: reason.clone() },
                vec![ReleaseSession { id }, EmitFailed { reason }, EmitState],
            )
        }

        // -----------------
        // Device watcher
        // -----------------
        (_, DeviceSetChanged { devices }) => {
            let mut effects = vec![EmitDevices { devices: devices.clone() }];
            let bound = match state {
                Armed { session } => Some(session),
                Recording { session, .. } => Some(session),
                Paused { session, .. } => Some(session),
                _ => None,
            };
            if let Some(session) = bound {
                if !device_present(&devices, &session.device_id) {
                    log::warn!(
                        "Active input device disappeared, rebinding to default"
                    );
                    effects.push(BindFallback { id: session.session_id });
                }
            }
            (state.clone(), effects)
        }

        // -----------------
        // Call overlay hook
        // -----------------
        (Arming { session, stop_requested, start_requested }, CallConnected { number }) => {
            let mut session = session.clone();
            session.call_number = Some(number);
            (
                Arming {
                    session,
                    stop_requested: *stop_requested,
                    start_requested: *start_requested,
                },
                vec![],
            )
        }
        (Armed { session }, CallConnected { number }) => {
            let mut session = session.clone();
            session.call_number = Some(number);
            (Armed { session }, vec![])
        }

        // -----------------
        // Finalizing
        // -----------------
        (Finalizing { session, duration_seconds }, FinalizeReady { id, artifact })
            if !is_stale(id) =>
        {
            let artifact = Arc::new(artifact);
            let meta = upload_meta(session, *duration_seconds);
            (
                Completed {
                    session: session.clone(),
                    artifact: Arc::clone(&artifact),
                    durability: None,
                },
                vec![
                    Persist { id, artifact, meta },
                    ReleaseSession { id },
                    EmitState,
                ],
            )
        }
        (Finalizing { .. }, EncoderFailed { id, err }) if !is_stale(id) => {
            let reason = FailureReason::Capture(err);
            (
                Failed { reason: reason.clone() },
                vec![ReleaseSession { id }, EmitFailed { reason }, EmitState],
            )
        }

        // -----------------
        // Completed
        // -----------------
        (Completed { session, artifact, .. }, PersistDone { id, status })
            if !is_stale(id) =>
        {
            (
                Completed {
                    session: session.clone(),
                    artifact: Arc::clone(artifact),
                    durability: Some(status.clone()),
                },
                vec![
                    EmitFinalized { artifact: Arc::clone(artifact), status },
                    EmitState,
                ],
            )
        }

        // Finalize is exactly-once: late stops and duplicate completions
        // fall through to the catch-all below.
        (_, event) => {
            log::debug!("Ignoring event in current state: {:?}", event);
            (state.clone(), vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_event() -> Event {
        Event::Arm {
            mode: Mode::InPerson,
            call_method: None,
            device_id: None,
            title: None,
        }
    }

    fn armed_session() -> (State, Uuid) {
        let (state, _) = reduce(&State::Idle, arm_event());
        let id = current_id(&state).unwrap();
        let (state, _) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/flac".to_string(),
            },
        );
        (state, id)
    }

    fn artifact() -> CapturedArtifact {
        CapturedArtifact {
            mime_type: "audio/flac".to_string(),
            duration_seconds: 3,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn arm_from_idle_acquires_input() {
        let (state, effects) = reduce(&State::Idle, arm_event());
        assert!(matches!(state, State::Arming { stop_requested: false, .. }));
        assert!(matches!(effects[0], Effect::AcquireInput { .. }));
    }

    #[test]
    fn default_title_is_applied() {
        let (state, _) = reduce(&State::Idle, arm_event());
        match state {
            State::Arming { session, .. } => assert_eq!(session.title, DEFAULT_TITLE),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn start_begins_encoding_and_ticking() {
        let (state, id) = armed_session();
        let (state, effects) = reduce(&state, Event::Start { at_ms: 5000 });
        assert!(matches!(
            state,
            State::Recording { started_at_ms: 5000, accumulated_paused_ms: 0, .. }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartEncoder { id: eid } if *eid == id)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartElapsedTick { .. })));
    }

    #[test]
    fn pause_accumulates_into_elapsed() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 1000 });
        let (state, _) = reduce(&state, Event::Pause { at_ms: 4000 });
        let (state, _) = reduce(&state, Event::Resume { at_ms: 9000 });
        match &state {
            State::Recording { accumulated_paused_ms, .. } => {
                assert_eq!(*accumulated_paused_ms, 5000)
            }
            other => panic!("unexpected state: {:?}", other),
        }
        // 1s..13s wall clock minus 5s paused = 7s elapsed.
        let (_, effects) = reduce(&state, Event::ElapsedTick { id, now_ms: 13_000 });
        assert!(matches!(effects[0], Effect::EmitElapsed { seconds: 7 }));
    }

    #[test]
    fn elapsed_does_not_advance_while_paused() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, _) = reduce(&state, Event::Pause { at_ms: 2000 });
        let (_, effects) = reduce(&state, Event::ElapsedTick { id, now_ms: 60_000 });
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_from_paused_freezes_duration_at_pause_point() {
        let (state, _) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, _) = reduce(&state, Event::Pause { at_ms: 6000 });
        let (state, effects) = reduce(&state, Event::Stop { at_ms: 99_000 });
        assert!(matches!(state, State::Finalizing { duration_seconds: 6, .. }));
        // The graph stays suspended only while paused.
        assert!(effects.iter().any(|e| matches!(e, Effect::ResumeGraph)));
    }

    #[test]
    fn stop_during_arming_is_latched() {
        let (state, _) = reduce(&State::Idle, arm_event());
        let id = current_id(&state).unwrap();
        let (state, effects) = reduce(&state, Event::Stop { at_ms: 100 });
        assert!(matches!(state, State::Arming { stop_requested: true, .. }));
        assert!(effects.is_empty());

        let (state, effects) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/wav".to_string(),
            },
        );
        assert!(matches!(state, State::Finalizing { duration_seconds: 0, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopEncoder { .. })));
    }

    #[test]
    fn start_during_arming_is_latched() {
        let (state, _) = reduce(&State::Idle, arm_event());
        let id = current_id(&state).unwrap();
        let (state, effects) = reduce(&state, Event::Start { at_ms: 2000 });
        assert!(matches!(
            state,
            State::Arming { start_requested: Some(2000), .. }
        ));
        assert!(effects.is_empty());

        // Recording begins as soon as the hardware comes up, stamped with
        // the original start time.
        let (state, effects) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/flac".to_string(),
            },
        );
        assert!(matches!(
            state,
            State::Recording { started_at_ms: 2000, accumulated_paused_ms: 0, .. }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartEncoder { id: eid } if *eid == id)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartElapsedTick { .. })));
    }

    #[test]
    fn start_from_idle_arms_then_records() {
        let (state, effects) = reduce(&State::Idle, Event::Start { at_ms: 500 });
        assert!(matches!(
            state,
            State::Arming { start_requested: Some(500), .. }
        ));
        assert!(matches!(effects[0], Effect::AcquireInput { .. }));

        let id = current_id(&state).unwrap();
        let (state, _) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/wav".to_string(),
            },
        );
        assert!(matches!(state, State::Recording { started_at_ms: 500, .. }));
    }

    #[test]
    fn latched_stop_wins_over_latched_start() {
        let (state, _) = reduce(&State::Idle, arm_event());
        let id = current_id(&state).unwrap();
        let (state, _) = reduce(&state, Event::Start { at_ms: 100 });
        let (state, _) = reduce(&state, Event::Stop { at_ms: 200 });
        let (state, _) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/wav".to_string(),
            },
        );
        assert!(matches!(state, State::Finalizing { duration_seconds: 0, .. }));
    }

    #[test]
    fn call_connect_from_idle_arms_a_call_session() {
        let (state, effects) = reduce(
            &State::Idle,
            Event::CallConnected { number: "+15550100".to_string() },
        );
        match &state {
            State::Arming { session, .. } => {
                assert_eq!(session.mode, Mode::Call);
                assert_eq!(session.call_number.as_deref(), Some("+15550100"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(matches!(
            effects[0],
            Effect::AcquireInput { mode: Mode::Call, .. }
        ));

        // The overlay's Start follows in the same loop iteration.
        let (state, _) = reduce(&state, Event::Start { at_ms: 1500 });
        assert!(matches!(
            state,
            State::Arming { start_requested: Some(1500), .. }
        ));
    }

    #[test]
    fn stop_while_armed_yields_zero_duration() {
        let (state, _) = armed_session();
        let (state, _) = reduce(&state, Event::Stop { at_ms: 42 });
        assert!(matches!(state, State::Finalizing { duration_seconds: 0, .. }));
    }

    #[test]
    fn finalize_is_idempotent() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, _) = reduce(&state, Event::Stop { at_ms: 3000 });
        let (state, effects) = reduce(&state, Event::FinalizeReady { id, artifact: artifact() });
        assert!(matches!(state, State::Completed { .. }));
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Persist { .. }))
                .count(),
            1
        );

        // A duplicate completion changes nothing and persists nothing.
        let (state, effects) = reduce(&state, Event::FinalizeReady { id, artifact: artifact() });
        assert!(matches!(state, State::Completed { .. }));
        assert!(effects.is_empty());

        // Late stops are no-ops too.
        let (_, effects) = reduce(&state, Event::Stop { at_ms: 9000 });
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_completions_are_dropped() {
        let (state, _) = armed_session();
        let stranger = Uuid::new_v4();
        let (next, effects) =
            reduce(&state, Event::FinalizeReady { id: stranger, artifact: artifact() });
        assert!(matches!(next, State::Armed { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn switch_device_preserves_timing() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 1000 });
        let (state, effects) = reduce(
            &state,
            Event::SwitchDevice { device_id: "headset".to_string() },
        );
        assert!(matches!(
            effects[0],
            Effect::BindSource { id: eid, .. } if eid == id
        ));
        let (state, _) = reduce(
            &state,
            Event::SourceBound { id, device_id: "headset".to_string() },
        );
        match state {
            State::Recording { session, started_at_ms, .. } => {
                assert_eq!(session.device_id.as_deref(), Some("headset"));
                assert_eq!(started_at_ms, 1000);
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn device_loss_triggers_fallback_bind() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (_, effects) = reduce(&state, Event::DeviceSetChanged { devices: vec![] });
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitDevices { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::BindFallback { id: eid } if *eid == id)));
    }

    #[test]
    fn fallback_failure_fails_the_session() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, effects) = reduce(
            &state,
            Event::BindFailed { id, reason: FailureReason::DeviceUnavailable },
        );
        assert!(matches!(
            state,
            State::Failed { reason: FailureReason::DeviceUnavailable }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseSession { .. })));
    }

    #[test]
    fn degraded_persistence_still_completes() {
        let (state, id) = armed_session();
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, _) = reduce(&state, Event::Stop { at_ms: 3000 });
        let (state, _) = reduce(&state, Event::FinalizeReady { id, artifact: artifact() });
        let status = DurabilityStatus::Degraded {
            error: "upstream unavailable".to_string(),
            backup: None,
        };
        let (state, effects) = reduce(&state, Event::PersistDone { id, status });
        assert!(matches!(
            state,
            State::Completed { durability: Some(DurabilityStatus::Degraded { .. }), .. }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitFinalized { .. })));
    }

    #[test]
    fn direct_line_number_lands_in_upload_title() {
        let (state, _) = reduce(
            &State::Idle,
            Event::Arm {
                mode: Mode::Call,
                call_method: Some(CallMethod::DirectLine),
                device_id: None,
                title: None,
            },
        );
        let id = current_id(&state).unwrap();
        let (state, _) = reduce(
            &state,
            Event::CallConnected { number: "+15551234".to_string() },
        );
        let (state, _) = reduce(
            &state,
            Event::ArmOk {
                id,
                device_id: "mic".to_string(),
                mime_type: "audio/flac".to_string(),
            },
        );
        let (state, _) = reduce(&state, Event::Start { at_ms: 0 });
        let (state, _) = reduce(&state, Event::Stop { at_ms: 4000 });
        let (_, effects) = reduce(&state, Event::FinalizeReady { id, artifact: artifact() });
        let meta = effects
            .iter()
            .find_map(|e| match e {
                Effect::Persist { meta, .. } => Some(meta.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(meta.title, "New Session (+15551234)");
        assert_eq!(meta.mode_label, "Direct Line");
        assert_eq!(meta.tags, vec!["Live Capture", "Direct Line"]);
        assert_eq!(meta.duration_seconds, 4);
    }

    #[test]
    fn arm_failure_is_terminal_but_rearmable() {
        let (state, _) = reduce(&State::Idle, arm_event());
        let id = current_id(&state).unwrap();
        let (state, _) = reduce(
            &state,
            Event::ArmFail { id, reason: FailureReason::PermissionDenied },
        );
        assert!(matches!(state, State::Failed { .. }));

        let (state, effects) = reduce(&state, arm_event());
        assert!(matches!(state, State::Arming { .. }));
        assert!(matches!(effects[0], Effect::AcquireInput { .. }));
    }
}
