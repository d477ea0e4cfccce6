//! Input device registry
//!
//! Wraps the host's ambient device list behind a trait so the rest of the
//! pipeline never touches cpal directly and tests can substitute fakes.
//! Device labels are only populated after the one-time permission grant;
//! before that devices are enumerable but unlabeled.

use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use super::graph::SuppressionProfile;

/// Errors surfaced by the device registry.
#[derive(Debug, Clone)]
pub enum RegistryError {
    PermissionDenied,
    DeviceUnavailable(String),
    StreamCreationFailed(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::PermissionDenied => write!(f, "Audio input permission denied"),
            RegistryError::DeviceUnavailable(id) => {
                write!(f, "Audio input device unavailable: {}", id)
            }
            RegistryError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// One enumerable audio input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    /// Empty until the registry's permission has been granted.
    pub label: String,
}

/// Callback receiving interleaved i16 samples from the active stream.
pub type FrameCallback = Box<dyn FnMut(&[i16], u32, u16) + Send + 'static>;

/// Handle to an open input stream. Dropping it releases the device's
/// hardware resources.
pub trait InputHandle: Send {
    fn device_id(&self) -> &str;
}

/// Registry over the host's audio input devices.
pub trait DeviceRegistry: Send + Sync {
    /// One-time permission grant. Must precede labeled enumeration and
    /// stream opening.
    fn request_permission(&self) -> Result<(), RegistryError>;

    /// Ordered list of input devices.
    fn list_input_devices(&self) -> Vec<DeviceDescriptor>;

    /// Identifier of the host's preferred input, if any.
    fn default_device_id(&self) -> Option<String>;

    /// Acquire a fresh stream for `device_id`, delivering samples to
    /// `on_frame` until the returned handle is dropped.
    fn open_stream(
        &self,
        device_id: &str,
        profile: &SuppressionProfile,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputHandle>, RegistryError>;
}

/// True when the two enumerations describe different device sets.
/// Label changes alone (e.g. post-grant labeling) do not count.
pub fn device_set_changed(old: &[DeviceDescriptor], new: &[DeviceDescriptor]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    old.iter()
        .zip(new.iter())
        .any(|(a, b)| a.device_id != b.device_id)
}

/// cpal-backed registry.
///
/// cpal exposes no stable device identifier, so the device name doubles as
/// the id. The suppression profile is advisory: cpal has no portable
/// echo-cancellation or noise-suppression knobs, so the profile is logged
/// and recorded but applied only by backends that support it.
pub struct CpalDeviceRegistry {
    granted: AtomicBool,
}

impl CpalDeviceRegistry {
    pub fn new() -> Self {
        Self {
            granted: AtomicBool::new(false),
        }
    }
}

impl Default for CpalDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry for CpalDeviceRegistry {
    fn request_permission(&self) -> Result<(), RegistryError> {
        // Native hosts grant implicitly; denial shows up as an empty host
        // with no default input.
        let host = cpal::default_host();
        if host.default_input_device().is_none() && self.list_input_devices().is_empty() {
            return Err(RegistryError::PermissionDenied);
        }
        self.granted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn list_input_devices(&self) -> Vec<DeviceDescriptor> {
        let host = cpal::default_host();
        let granted = self.granted.load(Ordering::SeqCst);

        let devices = match host.input_devices() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Failed to enumerate input devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceDescriptor {
                device_id: name.clone(),
                label: if granted { name } else { String::new() },
            })
            .collect()
    }

    fn default_device_id(&self) -> Option<String> {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| d.name().ok())
    }

    fn open_stream(
        &self,
        device_id: &str,
        profile: &SuppressionProfile,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputHandle>, RegistryError> {
        if !self.granted.load(Ordering::SeqCst) {
            return Err(RegistryError::PermissionDenied);
        }

        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(|e| RegistryError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
            .ok_or_else(|| RegistryError::DeviceUnavailable(device_id.to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| RegistryError::StreamCreationFailed(e.to_string()))?;

        log::info!(
            "Opening input stream: {} ({} Hz, {} ch, {:?}), suppression={:?}",
            device_id,
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format(),
            profile
        );

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        // cpal streams are not Send on every platform; a dedicated thread
        // owns the stream and tears it down when the handle signals stop.
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        std::thread::spawn(move || {
            let built = build_input_stream(&device, &config, sample_format, on_frame);
            match built {
                Ok(stream) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    // Park until the handle drops, then release the stream.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalInputHandle {
                device_id: device_id.to_string(),
                stop_tx: Some(stop_tx),
            })),
            Ok(Err(e)) => Err(RegistryError::StreamCreationFailed(e)),
            Err(_) => Err(RegistryError::StreamCreationFailed(
                "audio thread exited before stream start".to_string(),
            )),
        }
    }
}

struct CpalInputHandle {
    device_id: String,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl InputHandle for CpalInputHandle {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for CpalInputHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: SampleFormat,
    on_frame: FrameCallback,
) -> Result<cpal::Stream, String> {
    match sample_format {
        SampleFormat::I16 => build_input_stream_typed::<i16>(device, config, on_frame),
        SampleFormat::U16 => build_input_stream_typed::<u16>(device, config, on_frame),
        SampleFormat::F32 => build_input_stream_typed::<f32>(device, config, on_frame),
        other => Err(format!("unsupported sample format: {:?}", other)),
    }
}

fn build_input_stream_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, String>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| log::error!("Audio stream error: {}", err);
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                on_frame(&converted, sample_rate, channels);
            },
            err_fn,
            None,
        )
        .map_err(|e| e.to_string())
}

/// Convert any cpal sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: id.to_string(),
            label: id.to_string(),
        }
    }

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn unchanged_set_is_not_a_change() {
        let old = vec![desc("a"), desc("b")];
        let new = vec![desc("a"), desc("b")];
        assert!(!device_set_changed(&old, &new));
    }

    #[test]
    fn unplug_is_a_change() {
        let old = vec![desc("a"), desc("b")];
        let new = vec![desc("a")];
        assert!(device_set_changed(&old, &new));
    }

    #[test]
    fn hotplug_is_a_change() {
        let old = vec![desc("a")];
        let new = vec![desc("a"), desc("headset")];
        assert!(device_set_changed(&old, &new));
    }

    #[test]
    fn label_change_alone_is_not_a_change() {
        let old = vec![DeviceDescriptor {
            device_id: "a".to_string(),
            label: String::new(),
        }];
        let new = vec![DeviceDescriptor {
            device_id: "a".to_string(),
            label: "Microphone A".to_string(),
        }];
        assert!(!device_set_changed(&old, &new));
    }
}
