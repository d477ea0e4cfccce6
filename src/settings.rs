use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Chunk cut cadence during recording.
    pub chunk_interval_ms: u64,

    /// Simulated dial-to-connect delay for call-mode sessions.
    pub connect_delay_ms: u64,

    /// Visualizer publish cadence (~30 fps).
    pub frame_interval_ms: u64,

    /// Device hot-plug polling cadence.
    pub device_poll_interval_ms: u64,

    /// Backups kept locally after degraded persistence.
    pub max_backups: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 1000,
            connect_delay_ms: 1500,
            frame_interval_ms: 33,
            device_poll_interval_ms: 2000,
            max_backups: 5,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir =
        dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join("diktalo-capture").join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> CaptureSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return CaptureSettings::default();
        }
    };
    load_settings_from(&path)
}

pub fn load_settings_from(path: &Path) -> CaptureSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<CaptureSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                CaptureSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CaptureSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            CaptureSettings::default()
        }
    }
}

pub fn save_settings(settings: &CaptureSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

pub fn save_settings_to(path: &Path, settings: &CaptureSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: temp file in the same directory, then rename, so a
    // crash mid-write never leaves a corrupt settings.json.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix rename atomically replaces the destination; on Windows it
    // fails if the destination exists, so remove it first.
    if cfg!(windows) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
