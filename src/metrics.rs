//! Session metrics
//!
//! Tracks per-session outcomes (duration, chunk counts, artifact size,
//! durability) and a bounded error history for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Maximum number of completed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Outcome record for one finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Unix timestamp when the record was written (seconds)
    pub recorded_at: i64,
    pub mode_label: String,
    pub duration_seconds: u32,
    pub chunk_count: u64,
    pub artifact_bytes: u64,
    /// False when persistence degraded to a local backup
    pub durable: bool,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    /// Category, e.g. "arming", "capture", "persistence"
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    pub degraded_sessions: u64,
    pub avg_duration_seconds: u32,
    pub last_error: Option<ErrorRecord>,
}

/// Collects session outcomes, newest first, bounded.
pub struct MetricsCollector {
    history: VecDeque<SessionRecord>,
    errors: VecDeque<ErrorRecord>,
    total_sessions: u64,
    successful_sessions: u64,
    degraded_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            total_sessions: 0,
            successful_sessions: 0,
            degraded_sessions: 0,
        }
    }

    pub fn session_completed(
        &mut self,
        session_id: Uuid,
        mode_label: &str,
        duration_seconds: u32,
        chunk_count: u64,
        artifact_bytes: u64,
        durable: bool,
    ) {
        self.total_sessions += 1;
        self.successful_sessions += 1;
        if !durable {
            self.degraded_sessions += 1;
        }
        log::info!(
            "Metrics: session {} completed - {}s, {} chunks, {} bytes, durable={}",
            session_id,
            duration_seconds,
            chunk_count,
            artifact_bytes,
            durable
        );
        self.add_to_history(SessionRecord {
            session_id: session_id.to_string(),
            recorded_at: chrono::Utc::now().timestamp(),
            mode_label: mode_label.to_string(),
            duration_seconds,
            chunk_count,
            artifact_bytes,
            durable,
            success: true,
            error_message: None,
        });
    }

    pub fn session_failed(&mut self, session_id: Option<Uuid>, error_type: &str, message: &str) {
        self.total_sessions += 1;
        log::warn!("Metrics: session failed ({}): {}", error_type, message);
        if let Some(id) = session_id {
            self.add_to_history(SessionRecord {
                session_id: id.to_string(),
                recorded_at: chrono::Utc::now().timestamp(),
                mode_label: String::new(),
                duration_seconds: 0,
                chunk_count: 0,
                artifact_bytes: 0,
                durable: false,
                success: false,
                error_message: Some(message.to_string()),
            });
        }
        self.record_error(error_type, message, session_id);
    }

    pub fn record_error(&mut self, error_type: &str, message: &str, session_id: Option<Uuid>) {
        self.errors.push_front(ErrorRecord {
            timestamp: chrono::Utc::now().timestamp(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            session_id: session_id.map(|id| id.to_string()),
        });
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|r| r.success).collect();
        let avg_duration = if successful.is_empty() {
            0
        } else {
            let sum: u64 = successful.iter().map(|r| r.duration_seconds as u64).sum();
            (sum / successful.len() as u64) as u32
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            successful_sessions: self.successful_sessions,
            failed_sessions: self.total_sessions.saturating_sub(self.successful_sessions),
            degraded_sessions: self.degraded_sessions,
            avg_duration_seconds: avg_duration,
            last_error: self.errors.front().cloned(),
        }
    }

    pub fn get_history(&self) -> Vec<SessionRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, record: SessionRecord) {
        self.history.push_front(record);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
