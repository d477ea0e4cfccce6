//! Effect runner
//!
//! Executes the effects produced by the session and call reducers. Each
//! effect is handled by a spawned task that answers with events over the
//! loop's input channel; the reducers stay pure and never block.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::devices::{DeviceRegistry, RegistryError};
use crate::audio::encoder::{
    select_encoding, CapturedArtifact, ChunkEncoder, EncodingCandidate, EncodingSupport,
};
use crate::audio::graph::{AudioGraph, SuppressionProfile};
use crate::audio::visualizer::run_visualizer;
use crate::call::CallEffect;
use crate::metrics::MetricsCollector;
use crate::persist::{persist_artifact, ArtifactSink, DurabilityStatus};
use crate::session::{Effect, Event, FailureReason, Mode};
use crate::settings::CaptureSettings;
use crate::{Input, PipelineEvent};

/// Trait for running effects asynchronously. Completion events are sent
/// back over the loop input channel. `Emit*` effects and call-to-session
/// forwarding are handled at the loop edge, never here.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Input>);
    fn spawn_call(&self, effect: CallEffect, tx: mpsc::Sender<Input>);
}

enum EncoderCmd {
    Pause,
    Resume,
    Stop { duration_seconds: u32 },
}

struct EncoderHandle {
    cmd_tx: mpsc::Sender<EncoderCmd>,
}

/// The production runner: cpal devices through the routing graph, chunked
/// encoding, and the persistence adapter.
pub struct CaptureEffectRunner {
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn ArtifactSink>,
    support: Arc<dyn EncodingSupport>,
    graph: Arc<AudioGraph>,
    /// Negotiated encoding per armed session.
    armed: Arc<Mutex<HashMap<Uuid, EncodingCandidate>>>,
    /// Live encoder tasks. A std mutex so handles are inserted and removed
    /// synchronously in `spawn`, keeping start/stop/release ordered the way
    /// the reducer emitted them.
    encoders: Arc<StdMutex<HashMap<Uuid, EncoderHandle>>>,
    /// Chunk totals reported by finished encoders, consumed at persist time.
    chunk_counts: Arc<Mutex<HashMap<Uuid, u64>>>,
    /// Sessions whose elapsed ticker should keep running.
    active: Arc<Mutex<HashSet<Uuid>>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    settings: CaptureSettings,
    backup_dir: Option<PathBuf>,
    pipeline_events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    epoch: tokio::time::Instant,
}

impl CaptureEffectRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn ArtifactSink>,
        support: Arc<dyn EncodingSupport>,
        graph: Arc<AudioGraph>,
        metrics: Arc<Mutex<MetricsCollector>>,
        settings: CaptureSettings,
        backup_dir: Option<PathBuf>,
        pipeline_events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
        epoch: tokio::time::Instant,
    ) -> Arc<Self> {
        // Disposal must release the device stream promptly, not whenever
        // the last Arc to the graph happens to drop.
        {
            let graph = Arc::clone(&graph);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                graph.unbind();
            });
        }

        Arc::new(Self {
            registry,
            sink,
            support,
            graph,
            armed: Arc::new(Mutex::new(HashMap::new())),
            encoders: Arc::new(StdMutex::new(HashMap::new())),
            chunk_counts: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashSet::new())),
            metrics,
            settings,
            backup_dir,
            pipeline_events,
            cancel,
            epoch,
        })
    }
}

fn map_registry_error(e: RegistryError) -> FailureReason {
    match e {
        RegistryError::PermissionDenied => FailureReason::PermissionDenied,
        RegistryError::DeviceUnavailable(_) => FailureReason::DeviceUnavailable,
        RegistryError::StreamCreationFailed(m) => FailureReason::Capture(m),
    }
}

impl EffectRunner for CaptureEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Input>) {
        match effect {
            Effect::AcquireInput { id, mode, device_id } => {
                // Build the graph (and its visualizer tap) before touching
                // hardware; it persists across sessions.
                if let Some(taps) = self.graph.ensure() {
                    tokio::spawn(run_visualizer(
                        self.pipeline_events.clone(),
                        taps.sampler_rx,
                        Duration::from_millis(self.settings.frame_interval_ms),
                        self.cancel.child_token(),
                    ));
                }

                let registry = self.registry.clone();
                let support = self.support.clone();
                let graph = self.graph.clone();
                let armed = self.armed.clone();
                let active = self.active.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    let acquire = {
                        let registry = registry.clone();
                        let graph = graph.clone();
                        tokio::task::spawn_blocking(move || {
                            acquire_input(
                                registry.as_ref(),
                                support.as_ref(),
                                graph.as_ref(),
                                mode,
                                device_id,
                            )
                        })
                        .await
                    };

                    match acquire {
                        Ok(Ok((device, encoding))) => {
                            armed.lock().await.insert(id, encoding);
                            active.lock().await.insert(id);
                            let _ = tx
                                .send(Input::Session(Event::ArmOk {
                                    id,
                                    device_id: device,
                                    mime_type: encoding.mime_type.to_string(),
                                }))
                                .await;
                        }
                        Ok(Err(reason)) => {
                            log::error!("Arming failed: {}", reason);
                            metrics.lock().await.session_failed(
                                Some(id),
                                "arming",
                                &reason.to_string(),
                            );
                            let _ = tx.send(Input::Session(Event::ArmFail { id, reason })).await;
                        }
                        Err(e) => {
                            let reason = FailureReason::Capture(e.to_string());
                            let _ = tx.send(Input::Session(Event::ArmFail { id, reason })).await;
                        }
                    }
                });
            }

            Effect::BindSource { id, device_id } => {
                let registry = self.registry.clone();
                let graph = self.graph.clone();
                tokio::spawn(async move {
                    let result = {
                        let device = device_id.clone();
                        tokio::task::spawn_blocking(move || {
                            let profile = graph.current_profile();
                            graph.bind_source(registry.as_ref(), &device, profile)
                        })
                        .await
                    };
                    let event = match result {
                        Ok(Ok(())) => Event::SourceBound { id, device_id },
                        Ok(Err(e)) => Event::BindFailed { id, reason: map_registry_error(e) },
                        Err(e) => Event::BindFailed {
                            id,
                            reason: FailureReason::Capture(e.to_string()),
                        },
                    };
                    let _ = tx.send(Input::Session(event)).await;
                });
            }

            Effect::BindFallback { id } => {
                let registry = self.registry.clone();
                let graph = self.graph.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        let fallback = registry
                            .default_device_id()
                            .ok_or(FailureReason::DeviceUnavailable)?;
                        let profile = graph.current_profile();
                        graph
                            .bind_source(registry.as_ref(), &fallback, profile)
                            .map_err(|_| FailureReason::DeviceUnavailable)?;
                        Ok::<_, FailureReason>(fallback)
                    })
                    .await;
                    let event = match result {
                        Ok(Ok(device_id)) => {
                            log::info!("Fell back to default input: {}", device_id);
                            Event::SourceBound { id, device_id }
                        }
                        Ok(Err(reason)) => Event::BindFailed { id, reason },
                        Err(e) => Event::BindFailed {
                            id,
                            reason: FailureReason::Capture(e.to_string()),
                        },
                    };
                    let _ = tx.send(Input::Session(event)).await;
                });
            }

            Effect::StartEncoder { id } => {
                // The handle goes into the map before the task exists, so a
                // stop issued in the very next loop iteration finds it and
                // the command is buffered for the task to consume.
                let (cmd_tx, cmd_rx) = mpsc::channel(8);
                self.encoders.lock().unwrap().insert(id, EncoderHandle { cmd_tx });

                let armed = self.armed.clone();
                let encoders = self.encoders.clone();
                let chunk_counts = self.chunk_counts.clone();
                let graph = self.graph.clone();
                let cancel = self.cancel.child_token();
                let chunk_interval = Duration::from_millis(self.settings.chunk_interval_ms);
                let epoch = self.epoch;

                tokio::spawn(async move {
                    let Some(encoding) = armed.lock().await.get(&id).copied() else {
                        log::warn!("StartEncoder: session {} was never armed", id);
                        encoders.lock().unwrap().remove(&id);
                        return;
                    };
                    let Some(bus_rx) = graph.subscribe_bus() else {
                        encoders.lock().unwrap().remove(&id);
                        let _ = tx
                            .send(Input::Session(Event::EncoderFailed {
                                id,
                                err: "audio graph not built".to_string(),
                            }))
                            .await;
                        return;
                    };

                    run_encoder_task(
                        id,
                        encoding,
                        bus_rx,
                        cmd_rx,
                        chunk_interval,
                        epoch,
                        cancel,
                        tx,
                        chunk_counts,
                    )
                    .await;

                    encoders.lock().unwrap().remove(&id);
                });
            }

            Effect::PauseEncoder { id } => {
                let cmd = self.encoders.lock().unwrap().get(&id).map(|h| h.cmd_tx.clone());
                if let Some(cmd) = cmd {
                    tokio::spawn(async move {
                        let _ = cmd.send(EncoderCmd::Pause).await;
                    });
                }
            }

            Effect::ResumeEncoder { id } => {
                let cmd = self.encoders.lock().unwrap().get(&id).map(|h| h.cmd_tx.clone());
                if let Some(cmd) = cmd {
                    tokio::spawn(async move {
                        let _ = cmd.send(EncoderCmd::Resume).await;
                    });
                }
            }

            Effect::StopEncoder { id, duration_seconds } => {
                let cmd = self.encoders.lock().unwrap().get(&id).map(|h| h.cmd_tx.clone());
                let armed = self.armed.clone();
                tokio::spawn(async move {
                    if let Some(cmd) = cmd {
                        let _ = cmd.send(EncoderCmd::Stop { duration_seconds }).await;
                        return;
                    }
                    // Encoder never started (stop before or instead of
                    // recording): finalize as an empty artifact.
                    let mime = armed
                        .lock()
                        .await
                        .get(&id)
                        .map(|e| e.mime_type)
                        .unwrap_or("audio/wav");
                    let _ = tx
                        .send(Input::Session(Event::FinalizeReady {
                            id,
                            artifact: CapturedArtifact {
                                mime_type: mime.to_string(),
                                duration_seconds: 0,
                                payload: Vec::new(),
                            },
                        }))
                        .await;
                });
            }

            Effect::SuspendGraph => self.graph.suspend(),
            Effect::ResumeGraph => self.graph.resume(),

            Effect::StartElapsedTick { id } => {
                let active = self.active.clone();
                let cancel = self.cancel.child_token();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = interval.tick() => {}
                        }
                        if !active.lock().await.contains(&id) {
                            log::debug!("Elapsed tick stopping - session {} released", id);
                            break;
                        }
                        let now_ms = epoch.elapsed().as_millis() as u64;
                        if tx
                            .send(Input::Session(Event::ElapsedTick { id, now_ms }))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }

            Effect::ReleaseSession { id } => {
                // Dropping the handle closes its command channel; an encoder
                // task that never received a stop (the session failed) exits
                // and discards its partial capture instead of ingesting bus
                // frames until disposal.
                self.encoders.lock().unwrap().remove(&id);

                let armed = self.armed.clone();
                let active = self.active.clone();
                tokio::spawn(async move {
                    active.lock().await.remove(&id);
                    armed.lock().await.remove(&id);
                    log::debug!("Session {} released", id);
                });
            }

            Effect::Persist { id, artifact, meta } => {
                let sink = self.sink.clone();
                let metrics = self.metrics.clone();
                let chunk_counts = self.chunk_counts.clone();
                let backup_dir = self.backup_dir.clone();
                let max_backups = self.settings.max_backups;

                tokio::spawn(async move {
                    let status = {
                        let sink = sink.clone();
                        let artifact = Arc::clone(&artifact);
                        let meta = meta.clone();
                        tokio::task::spawn_blocking(move || {
                            persist_artifact(
                                sink.as_ref(),
                                &artifact,
                                &meta,
                                backup_dir.as_deref(),
                                max_backups,
                            )
                        })
                        .await
                        .unwrap_or_else(|e| DurabilityStatus::Degraded {
                            error: e.to_string(),
                            backup: None,
                        })
                    };

                    let durable = matches!(status, DurabilityStatus::Durable);
                    let chunks = chunk_counts.lock().await.remove(&id).unwrap_or(0);
                    metrics.lock().await.session_completed(
                        id,
                        &meta.mode_label,
                        meta.duration_seconds,
                        chunks,
                        artifact.payload.len() as u64,
                        durable,
                    );

                    let _ = tx.send(Input::Session(Event::PersistDone { id, status })).await;
                });
            }

            Effect::EmitState
            | Effect::EmitElapsed { .. }
            | Effect::EmitFinalized { .. }
            | Effect::EmitFailed { .. }
            | Effect::EmitDevices { .. } => {
                unreachable!("emit effects are handled in the pipeline loop");
            }
        }
    }

    fn spawn_call(&self, effect: CallEffect, tx: mpsc::Sender<Input>) {
        match effect {
            CallEffect::StartConnectTimer { id } => {
                let delay = Duration::from_millis(self.settings.connect_delay_ms);
                let cancel = self.cancel.child_token();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    let _ = tx
                        .send(Input::Call(crate::call::CallEvent::ConnectTimer { id, now_ms }))
                        .await;
                });
            }
            CallEffect::Session(_) | CallEffect::EmitStatus => {
                unreachable!("call forwarding is handled in the pipeline loop");
            }
        }
    }
}

fn acquire_input(
    registry: &dyn DeviceRegistry,
    support: &dyn EncodingSupport,
    graph: &AudioGraph,
    mode: Mode,
    device_id: Option<String>,
) -> Result<(String, EncodingCandidate), FailureReason> {
    registry
        .request_permission()
        .map_err(|_| FailureReason::PermissionDenied)?;

    let device = device_id
        .or_else(|| registry.default_device_id())
        .ok_or(FailureReason::NoDevice)?;

    let encoding = select_encoding(support).map_err(|_| FailureReason::NoSupportedEncoding)?;

    graph
        .bind_source(registry, &device, SuppressionProfile::for_mode(mode))
        .map_err(map_registry_error)?;

    Ok((device, encoding))
}

#[allow(clippy::too_many_arguments)]
async fn run_encoder_task(
    id: Uuid,
    encoding: EncodingCandidate,
    mut bus_rx: tokio::sync::broadcast::Receiver<crate::audio::graph::AudioFrame>,
    mut cmd_rx: mpsc::Receiver<EncoderCmd>,
    chunk_interval: Duration,
    epoch: tokio::time::Instant,
    cancel: CancellationToken,
    tx: mpsc::Sender<Input>,
    chunk_counts: Arc<Mutex<HashMap<Uuid, u64>>>,
) {
    use tokio::sync::broadcast::error::RecvError;

    let mut encoder = ChunkEncoder::new(encoding);
    let mut tick = tokio::time::interval(chunk_interval);
    tick.tick().await;

    log::debug!("Encoder started for session {} ({})", id, encoding.mime_type);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Encoder for session {} cancelled", id);
                return;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(EncoderCmd::Pause) => encoder.pause(),
                Some(EncoderCmd::Resume) => encoder.resume(),
                Some(EncoderCmd::Stop { duration_seconds }) => {
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    match encoder.finalize(duration_seconds, now_ms) {
                        Ok(Some(artifact)) => {
                            chunk_counts
                                .lock()
                                .await
                                .insert(id, encoder.chunk_count() as u64);
                            let _ = tx
                                .send(Input::Session(Event::FinalizeReady { id, artifact }))
                                .await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx
                                .send(Input::Session(Event::EncoderFailed {
                                    id,
                                    err: e.to_string(),
                                }))
                                .await;
                        }
                    }
                    return;
                }
                // Command channel dropped without a stop: the session was
                // released after a failure. Discard the partial capture.
                None => return,
            },
            frame = bus_rx.recv() => match frame {
                Ok(frame) => encoder.ingest_frame(&frame),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Encoder for session {} lagged, {} frames dropped", id, n);
                }
                Err(RecvError::Closed) => return,
            },
            _ = tick.tick() => {
                let now_ms = epoch.elapsed().as_millis() as u64;
                encoder.cut_chunk(now_ms);
            }
        }
    }
}

/// Stub runner for loop tests: answers every effect with the happy path on
/// short simulated delays, no hardware involved.
pub struct StubEffectRunner {
    epoch: tokio::time::Instant,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { epoch: tokio::time::Instant::now() })
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Input>) {
        match effect {
            Effect::AcquireInput { id, .. } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = tx
                        .send(Input::Session(Event::ArmOk {
                            id,
                            device_id: "stub-mic".to_string(),
                            mime_type: "audio/wav".to_string(),
                        }))
                        .await;
                });
            }
            Effect::BindSource { id, device_id } => {
                tokio::spawn(async move {
                    let _ = tx.send(Input::Session(Event::SourceBound { id, device_id })).await;
                });
            }
            Effect::BindFallback { id } => {
                tokio::spawn(async move {
                    let _ = tx
                        .send(Input::Session(Event::SourceBound {
                            id,
                            device_id: "stub-default".to_string(),
                        }))
                        .await;
                });
            }
            Effect::StopEncoder { id, duration_seconds } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx
                        .send(Input::Session(Event::FinalizeReady {
                            id,
                            artifact: CapturedArtifact {
                                mime_type: "audio/wav".to_string(),
                                duration_seconds,
                                payload: if duration_seconds == 0 {
                                    Vec::new()
                                } else {
                                    vec![0u8; 64]
                                },
                            },
                        }))
                        .await;
                });
            }
            Effect::Persist { id, .. } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = tx
                        .send(Input::Session(Event::PersistDone {
                            id,
                            status: DurabilityStatus::Durable,
                        }))
                        .await;
                });
            }
            Effect::StartElapsedTick { id } => {
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    interval.tick().await;
                    for _ in 0..600 {
                        interval.tick().await;
                        let now_ms = epoch.elapsed().as_millis() as u64;
                        if tx
                            .send(Input::Session(Event::ElapsedTick { id, now_ms }))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            Effect::StartEncoder { .. }
            | Effect::PauseEncoder { .. }
            | Effect::ResumeEncoder { .. }
            | Effect::SuspendGraph
            | Effect::ResumeGraph
            | Effect::ReleaseSession { .. } => {}
            Effect::EmitState
            | Effect::EmitElapsed { .. }
            | Effect::EmitFinalized { .. }
            | Effect::EmitFailed { .. }
            | Effect::EmitDevices { .. } => {
                unreachable!("emit effects are handled in the pipeline loop");
            }
        }
    }

    fn spawn_call(&self, effect: CallEffect, tx: mpsc::Sender<Input>) {
        match effect {
            CallEffect::StartConnectTimer { id } => {
                let epoch = self.epoch;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    let _ = tx
                        .send(Input::Call(crate::call::CallEvent::ConnectTimer { id, now_ms }))
                        .await;
                });
            }
            CallEffect::Session(_) | CallEffect::EmitStatus => {
                unreachable!("call forwarding is handled in the pipeline loop");
            }
        }
    }
}
