//! Audio routing graph
//!
//! Owns the shared bus that feeds the encoder and the sampler tap that
//! feeds the visualizer. Built lazily on first use and kept for the whole
//! pipeline lifetime, so consecutive sessions reuse it; only the input
//! source binding is replaced when the user switches device or the mode's
//! suppression profile changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use super::devices::{DeviceRegistry, InputHandle, RegistryError};
use crate::session::Mode;

/// Bus capacity in frames. At ~10 frames/sec per cpal callback cadence this
/// is several seconds of headroom before a lagging encoder drops frames.
const BUS_CAPACITY: usize = 256;

/// Sampler channel capacity (bursts of sample batches for the visualizer).
const SAMPLER_CAPACITY: usize = 100;

/// Interleaved i16 PCM delivered on the bus.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Milliseconds since the pipeline epoch.
    pub captured_at_ms: u64,
}

/// Input-processing constraints requested from the device backend.
///
/// In-person sessions get aggressive noise suppression; call sessions keep
/// it off so the counterpart's voice arriving via speaker is not suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionProfile {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl SuppressionProfile {
    pub fn for_mode(mode: Mode) -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: mode == Mode::InPerson,
            auto_gain: true,
        }
    }
}

/// Receivers created exactly once, when the graph is first built.
pub struct GraphTaps {
    pub sampler_rx: mpsc::Receiver<Vec<i16>>,
}

struct GraphInner {
    bus_tx: Option<broadcast::Sender<AudioFrame>>,
    sampler_tx: Option<mpsc::Sender<Vec<i16>>>,
    input: Option<Box<dyn InputHandle>>,
    profile: SuppressionProfile,
}

/// The routing graph. Exclusive owner of the bus and sampler for the
/// lifetime of the pipeline instance; the input binding is a replaceable,
/// non-owning link to whichever device stream is currently live.
pub struct AudioGraph {
    inner: Mutex<GraphInner>,
    suspended: Arc<AtomicBool>,
    epoch: tokio::time::Instant,
}

impl AudioGraph {
    pub fn new(epoch: tokio::time::Instant) -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                bus_tx: None,
                sampler_tx: None,
                input: None,
                profile: SuppressionProfile::for_mode(Mode::InPerson),
            }),
            suspended: Arc::new(AtomicBool::new(false)),
            epoch,
        }
    }

    /// Idempotently build the bus and sampler. Returns the sampler tap on
    /// the first call only; later calls are no-ops.
    pub fn ensure(&self) -> Option<GraphTaps> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bus_tx.is_some() {
            return None;
        }
        let (bus_tx, _) = broadcast::channel(BUS_CAPACITY);
        let (sampler_tx, sampler_rx) = mpsc::channel(SAMPLER_CAPACITY);
        inner.bus_tx = Some(bus_tx);
        inner.sampler_tx = Some(sampler_tx);
        log::debug!("Audio graph built");
        Some(GraphTaps { sampler_rx })
    }

    /// Subscribe a new bus reader (one per recording session).
    pub fn subscribe_bus(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        let inner = self.inner.lock().unwrap();
        inner.bus_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Bind `device_id` as the graph's input source. The new stream is
    /// opened before the previous one is dropped, so recording continues on
    /// the bus across the momentary rebind gap. Safe mid-recording: the bus
    /// and any subscribed encoder are untouched.
    pub fn bind_source(
        &self,
        registry: &dyn DeviceRegistry,
        device_id: &str,
        profile: SuppressionProfile,
    ) -> Result<(), RegistryError> {
        let (bus_tx, sampler_tx) = {
            let inner = self.inner.lock().unwrap();
            match (&inner.bus_tx, &inner.sampler_tx) {
                (Some(b), Some(s)) => (b.clone(), s.clone()),
                _ => {
                    return Err(RegistryError::StreamCreationFailed(
                        "graph not built".to_string(),
                    ))
                }
            }
        };

        let suspended = Arc::clone(&self.suspended);
        let epoch = self.epoch;

        let on_frame: super::devices::FrameCallback =
            Box::new(move |samples: &[i16], sample_rate: u32, channels: u16| {
                if suspended.load(Ordering::SeqCst) {
                    return;
                }
                let captured_at_ms = epoch.elapsed().as_millis() as u64;
                // Encoder tap. No receiver (no active session) is fine.
                let _ = bus_tx.send(AudioFrame {
                    samples: samples.to_vec(),
                    sample_rate,
                    channels,
                    captured_at_ms,
                });
                // Visualizer tap. Dropped batches only cost display frames.
                let _ = sampler_tx.try_send(samples.to_vec());
            });

        let new_input = registry.open_stream(device_id, &profile, on_frame)?;

        let previous = {
            let mut inner = self.inner.lock().unwrap();
            inner.profile = profile;
            inner.input.replace(new_input)
        };
        if let Some(old) = previous {
            log::info!(
                "Input rebound: {} -> {}",
                old.device_id(),
                device_id
            );
            drop(old);
        } else {
            log::info!("Input bound: {}", device_id);
        }
        Ok(())
    }

    /// Release the current input stream's hardware resources.
    pub fn unbind(&self) {
        let previous = self.inner.lock().unwrap().input.take();
        if let Some(old) = previous {
            log::info!("Input released: {}", old.device_id());
        }
    }

    /// Pause processing graph-wide. Used in lockstep with encoder pause so
    /// no audio is captured and no processing cost is paid while paused.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn current_device(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.input.as_ref().map(|i| i.device_id().to_string())
    }

    pub fn current_profile(&self) -> SuppressionProfile {
        self.inner.lock().unwrap().profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::{DeviceDescriptor, FrameCallback};
    use std::sync::atomic::AtomicUsize;

    /// Registry whose streams hand their frame callback to the test, and
    /// count handle releases.
    struct FakeRegistry {
        callbacks: Mutex<Vec<FrameCallback>>,
        released: Arc<AtomicUsize>,
    }

    impl FakeRegistry {
        fn new() -> Self {
            Self {
                callbacks: Mutex::new(Vec::new()),
                released: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn drive(&self, samples: &[i16]) {
            let mut cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = cbs.last_mut() {
                cb(samples, 48_000, 1);
            }
        }
    }

    struct FakeHandle {
        device_id: String,
        released: Arc<AtomicUsize>,
    }

    impl InputHandle for FakeHandle {
        fn device_id(&self) -> &str {
            &self.device_id
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DeviceRegistry for FakeRegistry {
        fn request_permission(&self) -> Result<(), RegistryError> {
            Ok(())
        }

        fn list_input_devices(&self) -> Vec<DeviceDescriptor> {
            vec![DeviceDescriptor {
                device_id: "mic".to_string(),
                label: "Mic".to_string(),
            }]
        }

        fn default_device_id(&self) -> Option<String> {
            Some("mic".to_string())
        }

        fn open_stream(
            &self,
            device_id: &str,
            _profile: &SuppressionProfile,
            on_frame: FrameCallback,
        ) -> Result<Box<dyn InputHandle>, RegistryError> {
            self.callbacks.lock().unwrap().push(on_frame);
            Ok(Box::new(FakeHandle {
                device_id: device_id.to_string(),
                released: Arc::clone(&self.released),
            }))
        }
    }

    fn graph() -> AudioGraph {
        AudioGraph::new(tokio::time::Instant::now())
    }

    #[test]
    fn ensure_is_idempotent() {
        let g = graph();
        assert!(g.ensure().is_some());
        assert!(g.ensure().is_none());
    }

    #[test]
    fn rebind_releases_previous_stream() {
        let g = graph();
        let reg = FakeRegistry::new();
        g.ensure();

        g.bind_source(&reg, "mic-a", SuppressionProfile::for_mode(Mode::InPerson))
            .unwrap();
        assert_eq!(reg.released.load(Ordering::SeqCst), 0);
        assert_eq!(g.current_device().as_deref(), Some("mic-a"));

        g.bind_source(&reg, "mic-b", SuppressionProfile::for_mode(Mode::InPerson))
            .unwrap();
        assert_eq!(reg.released.load(Ordering::SeqCst), 1);
        assert_eq!(g.current_device().as_deref(), Some("mic-b"));
    }

    #[test]
    fn rebind_does_not_disturb_bus_subscription() {
        let g = graph();
        let reg = FakeRegistry::new();
        g.ensure();
        g.bind_source(&reg, "mic-a", SuppressionProfile::for_mode(Mode::InPerson))
            .unwrap();

        let mut rx = g.subscribe_bus().unwrap();
        reg.drive(&[1, 2, 3]);
        g.bind_source(&reg, "mic-b", SuppressionProfile::for_mode(Mode::InPerson))
            .unwrap();
        reg.drive(&[4, 5, 6]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.samples, vec![1, 2, 3]);
        assert_eq!(second.samples, vec![4, 5, 6]);
    }

    #[test]
    fn suspend_gates_ingest() {
        let g = graph();
        let reg = FakeRegistry::new();
        g.ensure();
        g.bind_source(&reg, "mic", SuppressionProfile::for_mode(Mode::InPerson))
            .unwrap();
        let mut rx = g.subscribe_bus().unwrap();

        g.suspend();
        reg.drive(&[9, 9]);
        assert!(rx.try_recv().is_err());

        g.resume();
        reg.drive(&[7]);
        assert_eq!(rx.try_recv().unwrap().samples, vec![7]);
    }

    #[test]
    fn unbind_releases_hardware() {
        let g = graph();
        let reg = FakeRegistry::new();
        g.ensure();
        g.bind_source(&reg, "mic", SuppressionProfile::for_mode(Mode::Call))
            .unwrap();
        g.unbind();
        assert_eq!(reg.released.load(Ordering::SeqCst), 1);
        assert!(g.current_device().is_none());
    }

    #[test]
    fn call_mode_disables_noise_suppression() {
        let meeting = SuppressionProfile::for_mode(Mode::InPerson);
        let call = SuppressionProfile::for_mode(Mode::Call);
        assert!(meeting.noise_suppression);
        assert!(!call.noise_suppression);
        assert!(call.echo_cancellation);
    }
}
