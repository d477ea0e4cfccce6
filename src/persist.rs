//! Persistence adapter
//!
//! Converts a finalized artifact into the self-contained durable form
//! (a base64 data URI), hands it to the `ArtifactSink` collaborator, and
//! on sink failure falls back to a local backup file so captured audio is
//! never discarded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::audio::encoder::CapturedArtifact;

#[derive(Debug, Clone)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Artifact sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Upload metadata assembled by the session machine at finalize time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UploadMeta {
    pub title: String,
    pub mode_label: String,
    pub tags: Vec<String>,
    pub duration_seconds: u32,
}

/// The payload handed to the sink.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactUpload {
    /// Self-contained data URI; survives any storage that can hold a string.
    pub encoded_artifact: String,
    pub duration_seconds: u32,
    pub title: String,
    pub mode: String,
    pub tags: Vec<String>,
}

/// Outcome of the persistence attempt. `Degraded` still means the session
/// completed; the artifact is kept in memory and, when possible, on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurabilityStatus {
    Durable,
    Degraded {
        error: String,
        backup: Option<PathBuf>,
    },
}

/// Downstream storage boundary. Implementations may block; the runner
/// calls `store` from a blocking task.
pub trait ArtifactSink: Send + Sync {
    fn store(&self, upload: &ArtifactUpload) -> Result<(), SinkError>;
}

/// Encode the artifact into its durable data-URI form.
pub fn encode_artifact(artifact: &CapturedArtifact) -> String {
    format!(
        "data:{};base64,{}",
        artifact.mime_type,
        BASE64.encode(&artifact.payload)
    )
}

pub fn build_upload(artifact: &CapturedArtifact, meta: &UploadMeta) -> ArtifactUpload {
    ArtifactUpload {
        encoded_artifact: encode_artifact(artifact),
        duration_seconds: meta.duration_seconds,
        title: meta.title.clone(),
        mode: meta.mode_label.clone(),
        tags: meta.tags.clone(),
    }
}

/// Default backup location under the platform data directory.
pub fn default_backup_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("diktalo-capture").join("backups"))
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/flac" => "flac",
        "audio/wav" => "wav",
        _ => "bin",
    }
}

/// Write the raw artifact payload to a timestamped file under `dir`.
pub fn write_backup(dir: &Path, artifact: &CapturedArtifact) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
    let path = dir.join(format!(
        "capture-{}.{}",
        stamp,
        extension_for(&artifact.mime_type)
    ));
    let mut file = fs::File::create(&path)?;
    file.write_all(&artifact.payload)?;
    file.sync_all()?;
    Ok(path)
}

/// Delete all but the newest `keep` backup files.
pub fn prune_backups(dir: &Path, keep: usize) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    // Timestamped names sort chronologically.
    entries.sort();
    if entries.len() <= keep {
        return Ok(());
    }
    let excess = entries.len() - keep;
    for path in entries.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("Failed to prune backup {:?}: {}", path, e);
        }
    }
    Ok(())
}

/// Persist the artifact, degrading to a local backup on sink failure.
/// Never returns an error: persistence problems must not lose audio or
/// fail a completed session.
pub fn persist_artifact(
    sink: &dyn ArtifactSink,
    artifact: &CapturedArtifact,
    meta: &UploadMeta,
    backup_dir: Option<&Path>,
    max_backups: usize,
) -> DurabilityStatus {
    let upload = build_upload(artifact, meta);
    match sink.store(&upload) {
        Ok(()) => {
            log::info!(
                "Artifact persisted: {} ({} bytes, {}s)",
                meta.title,
                artifact.payload.len(),
                meta.duration_seconds
            );
            DurabilityStatus::Durable
        }
        Err(e) => {
            log::error!("Artifact sink failed, keeping local backup: {}", e);
            let backup = backup_dir.and_then(|dir| match write_backup(dir, artifact) {
                Ok(path) => {
                    if let Err(e) = prune_backups(dir, max_backups) {
                        log::warn!("Backup pruning failed: {}", e);
                    }
                    Some(path)
                }
                Err(write_err) => {
                    log::error!("Backup write failed: {}", write_err);
                    None
                }
            });
            DurabilityStatus::Degraded {
                error: e.0,
                backup,
            }
        }
    }
}
