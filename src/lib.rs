//! Live audio capture and recording-session pipeline.
//!
//! The pipeline is a single-writer event loop: callers send operations,
//! the session and call reducers compute transitions, and an effect runner
//! executes the resulting work asynchronously, answering with events over
//! the same channel. Subscribers observe the pipeline through a stream of
//! [`PipelineEvent`]s.

pub mod audio;
pub mod call;
pub mod effects;
pub mod metrics;
pub mod persist;
pub mod session;
pub mod settings;

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use audio::devices::{device_set_changed, DeviceDescriptor, DeviceRegistry};
use audio::encoder::{CapturedArtifact, HostEncodings};
use audio::graph::AudioGraph;
use audio::visualizer::NUM_BUCKETS;
use call::{reduce_call, CallEffect, CallEvent, CallState, CallStatus};
use effects::{CaptureEffectRunner, EffectRunner};
use metrics::MetricsCollector;
use persist::{ArtifactSink, DurabilityStatus};
use session::{reduce, CallMethod, Effect, Event, FailureReason, Mode, State};
use settings::CaptureSettings;

/// Externally visible session phase, a tagged union for subscribers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Arming,
    Armed,
    Recording,
    Paused,
    Finalizing,
    Completed,
    Failed { message: String },
}

fn phase_of(state: &State) -> SessionPhase {
    match state {
        State::Idle => SessionPhase::Idle,
        State::Arming { .. } => SessionPhase::Arming,
        State::Armed { .. } => SessionPhase::Armed,
        State::Recording { .. } => SessionPhase::Recording,
        State::Paused { .. } => SessionPhase::Paused,
        State::Finalizing { .. } => SessionPhase::Finalizing,
        State::Completed { .. } => SessionPhase::Completed,
        State::Failed { reason } => SessionPhase::Failed { message: reason.to_string() },
    }
}

/// Everything the pipeline reports to its subscriber.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged(SessionPhase),
    VisualizerFrame([f32; NUM_BUCKETS]),
    ElapsedTick { seconds: u64 },
    Finalized {
        artifact: Arc<CapturedArtifact>,
        durability: DurabilityStatus,
    },
    Failed { reason: FailureReason },
    DeviceListChanged(Vec<DeviceDescriptor>),
    CallStatusChanged(CallStatus),
}

/// Loop input: either reducer's events travel over one channel so the
/// single writer stays single.
#[derive(Debug)]
pub enum Input {
    Session(Event),
    Call(CallEvent),
}

/// The pipeline was disposed or its loop has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineClosed;

impl std::fmt::Display for PipelineClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capture pipeline is closed")
    }
}

impl std::error::Error for PipelineClosed {}

/// Handle to a running capture pipeline.
pub struct CapturePipeline {
    input_tx: mpsc::Sender<Input>,
    cancel: CancellationToken,
    epoch: tokio::time::Instant,
}

impl CapturePipeline {
    /// Spawn the full pipeline against real collaborators. Returns the
    /// handle and the subscriber's event stream.
    pub fn spawn(
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn ArtifactSink>,
        settings: CaptureSettings,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let cancel = CancellationToken::new();
        let epoch = tokio::time::Instant::now();
        let (events_tx, events_rx) = mpsc::channel(64);

        let graph = Arc::new(AudioGraph::new(epoch));
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let runner = CaptureEffectRunner::new(
            Arc::clone(&registry),
            sink,
            Arc::new(HostEncodings),
            graph,
            metrics,
            settings.clone(),
            persist::default_backup_dir(),
            events_tx.clone(),
            cancel.clone(),
            epoch,
        );

        let (pipeline, events_rx) =
            Self::spawn_loop(runner, cancel, epoch, events_tx, events_rx);
        pipeline.spawn_device_watcher(registry, settings.device_poll_interval_ms);
        (pipeline, events_rx)
    }

    /// Spawn the loop with a custom runner; used by tests.
    pub fn spawn_with_runner(
        runner: Arc<dyn EffectRunner>,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let cancel = CancellationToken::new();
        let epoch = tokio::time::Instant::now();
        let (events_tx, events_rx) = mpsc::channel(64);
        Self::spawn_loop(runner, cancel, epoch, events_tx, events_rx)
    }

    fn spawn_loop(
        runner: Arc<dyn EffectRunner>,
        cancel: CancellationToken,
        epoch: tokio::time::Instant,
        events_tx: mpsc::Sender<PipelineEvent>,
        events_rx: mpsc::Receiver<PipelineEvent>,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (input_tx, input_rx) = mpsc::channel::<Input>(32);
        tokio::spawn(run_pipeline_loop(
            input_rx,
            input_tx.clone(),
            runner,
            events_tx,
            cancel.clone(),
        ));
        (Self { input_tx, cancel, epoch }, events_rx)
    }

    fn spawn_device_watcher(&self, registry: Arc<dyn DeviceRegistry>, poll_interval_ms: u64) {
        let tx = self.input_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(poll_interval_ms));
            let mut known: Vec<DeviceDescriptor> = Vec::new();
            let mut first = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let reg = Arc::clone(&registry);
                let devices = match tokio::task::spawn_blocking(move || {
                    reg.list_input_devices()
                })
                .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("Device poll task failed: {}", e);
                        continue;
                    }
                };
                if first || device_set_changed(&known, &devices) {
                    first = false;
                    known = devices.clone();
                    if tx
                        .send(Input::Session(Event::DeviceSetChanged { devices }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn send(&self, input: Input) -> Result<(), PipelineClosed> {
        self.input_tx.send(input).await.map_err(|_| PipelineClosed)
    }

    /// Prepare a session: permission, device, encoding, graph binding.
    pub async fn arm(
        &self,
        mode: Mode,
        call_method: Option<CallMethod>,
        device_id: Option<String>,
        title: Option<String>,
    ) -> Result<(), PipelineClosed> {
        self.send(Input::Session(Event::Arm { mode, call_method, device_id, title }))
            .await
    }

    pub async fn start(&self) -> Result<(), PipelineClosed> {
        let at_ms = self.now_ms();
        self.send(Input::Session(Event::Start { at_ms })).await
    }

    pub async fn pause(&self) -> Result<(), PipelineClosed> {
        let at_ms = self.now_ms();
        self.send(Input::Session(Event::Pause { at_ms })).await
    }

    pub async fn resume(&self) -> Result<(), PipelineClosed> {
        let at_ms = self.now_ms();
        self.send(Input::Session(Event::Resume { at_ms })).await
    }

    pub async fn stop(&self) -> Result<(), PipelineClosed> {
        let at_ms = self.now_ms();
        self.send(Input::Session(Event::Stop { at_ms })).await
    }

    pub async fn switch_device(&self, device_id: String) -> Result<(), PipelineClosed> {
        self.send(Input::Session(Event::SwitchDevice { device_id })).await
    }

    pub async fn dial(&self, number: String) -> Result<(), PipelineClosed> {
        self.send(Input::Call(CallEvent::Dial { number })).await
    }

    pub async fn hang_up(&self) -> Result<(), PipelineClosed> {
        let at_ms = self.now_ms();
        self.send(Input::Call(CallEvent::HangUp { at_ms })).await
    }

    /// Tear the pipeline down. All tasks stop and no further events are
    /// delivered; the handle is unusable afterwards.
    pub fn dispose(&self) {
        log::info!("Pipeline disposed");
        self.cancel.cancel();
    }
}

async fn run_pipeline_loop(
    mut rx: mpsc::Receiver<Input>,
    tx: mpsc::Sender<Input>,
    runner: Arc<dyn EffectRunner>,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    let mut session_state = State::default();
    let mut call_state = CallState::default();

    log::info!("Pipeline loop started");

    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => break,
            input = rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        // Call effects can forward session events; those are drained in the
        // same iteration so overlay-driven transitions are atomic with
        // respect to new caller input.
        let mut queue = VecDeque::new();
        queue.push_back(input);

        while let Some(input) = queue.pop_front() {
            match input {
                Input::Session(event) => {
                    log::debug!("Session event: {:?}", event);
                    let before = std::mem::discriminant(&session_state);
                    let (next, effects) = reduce(&session_state, event);
                    if before != std::mem::discriminant(&next) {
                        log::info!("Session transition: {:?}", phase_of(&next));
                    }
                    session_state = next;

                    for eff in effects {
                        match eff {
                            Effect::EmitState => {
                                let _ = events
                                    .send(PipelineEvent::StateChanged(phase_of(&session_state)))
                                    .await;
                            }
                            Effect::EmitElapsed { seconds } => {
                                let _ = events
                                    .send(PipelineEvent::ElapsedTick { seconds })
                                    .await;
                            }
                            Effect::EmitFinalized { artifact, status } => {
                                let _ = events
                                    .send(PipelineEvent::Finalized {
                                        artifact,
                                        durability: status,
                                    })
                                    .await;
                            }
                            Effect::EmitFailed { reason } => {
                                let _ = events.send(PipelineEvent::Failed { reason }).await;
                            }
                            Effect::EmitDevices { devices } => {
                                let _ = events
                                    .send(PipelineEvent::DeviceListChanged(devices))
                                    .await;
                            }
                            other => runner.spawn(other, tx.clone()),
                        }
                    }
                }
                Input::Call(event) => {
                    log::debug!("Call event: {:?}", event);
                    let (next, effects) = reduce_call(&call_state, event);
                    call_state = next;

                    for eff in effects {
                        match eff {
                            CallEffect::Session(ev) => queue.push_back(Input::Session(ev)),
                            CallEffect::EmitStatus => {
                                let _ = events
                                    .send(PipelineEvent::CallStatusChanged(call_state.status()))
                                    .await;
                            }
                            other => runner.spawn_call(other, tx.clone()),
                        }
                    }
                }
            }
        }
    }

    log::info!("Pipeline loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serialization_is_tagged() {
        let json = serde_json::to_string(&SessionPhase::Recording).unwrap();
        assert_eq!(json, r#"{"phase":"recording"}"#);

        let json = serde_json::to_string(&SessionPhase::Failed {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"phase":"failed","message":"boom"}"#);
    }

    #[test]
    fn failed_phase_carries_reason_text() {
        let state = State::Failed { reason: FailureReason::NoDevice };
        assert_eq!(
            phase_of(&state),
            SessionPhase::Failed {
                message: "No audio input device available".to_string()
            }
        );
    }
}
