use super::format_bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
    ServerToServer,
}

/// Task lifecycle. Moves forward only:
/// pending -> in_progress -> completed | failed | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// One queued transfer and its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub source_path: String,
    pub destination_path: String,
    pub file_name: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TransferTask {
    pub fn new(
        direction: TransferDirection,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        total_bytes: u64,
    ) -> Self {
        let source_path = source_path.into();
        let file_name = Path::new(source_path.trim_end_matches('/'))
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_path.clone());

        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            source_path,
            destination_path: destination_path.into(),
            file_name,
            total_bytes,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Pending -> in progress; false from any other state
    pub fn start(&mut self) -> bool {
        if self.status != TransferStatus::Pending {
            return false;
        }
        self.status = TransferStatus::InProgress;
        self.started_at = Some(Utc::now());
        true
    }

    /// Count `bytes` more as transferred, capped at the total
    pub fn advance(&mut self, bytes: u64) {
        if self.status.is_finished() {
            return;
        }
        self.bytes_transferred = self
            .bytes_transferred
            .saturating_add(bytes)
            .min(self.total_bytes);
    }

    pub fn complete(&mut self) -> bool {
        if self.status != TransferStatus::InProgress {
            return false;
        }
        self.bytes_transferred = self.total_bytes;
        self.finish(TransferStatus::Completed);
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status != TransferStatus::InProgress {
            return false;
        }
        self.error_message = Some(message.into());
        self.finish(TransferStatus::Failed);
        true
    }

    /// Allowed from pending or in progress only
    pub fn cancel(&mut self) -> bool {
        if self.status.is_finished() {
            return false;
        }
        self.finish(TransferStatus::Cancelled);
        true
    }

    fn finish(&mut self, status: TransferStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_transferred as f64 * 100.0 / self.total_bytes as f64
        }
    }

    pub fn status_text(&self) -> String {
        match self.status {
            TransferStatus::Pending => "Waiting...".to_string(),
            TransferStatus::InProgress => format!(
                "{:.1}% ({}/{})",
                self.progress_percent(),
                format_bytes(self.bytes_transferred),
                format_bytes(self.total_bytes)
            ),
            TransferStatus::Completed => format!("Completed ({})", format_bytes(self.total_bytes)),
            TransferStatus::Failed => format!(
                "Failed: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            ),
            TransferStatus::Cancelled => "Cancelled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        let mut task = TransferTask::new(TransferDirection::Upload, "/tmp/a.bin", "/srv", 100);
        assert_eq!(task.file_name, "a.bin");
        assert!(!task.complete());
        assert!(task.start());
        assert!(!task.start());
        assert!(task.complete());

        assert!(!task.fail("late"));
        assert!(!task.cancel());
        assert_eq!(task.status, TransferStatus::Completed);
        assert!(task.error_message.is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn cancel_from_pending() {
        let mut task = TransferTask::new(TransferDirection::Download, "/srv/x", "/tmp", 0);
        assert!(task.cancel());
        assert!(!task.start());
        assert_eq!(task.status_text(), "Cancelled");
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut task = TransferTask::new(TransferDirection::Upload, "/tmp/a", "/srv", 1000);
        task.start();
        task.advance(400);
        assert_eq!(task.progress_percent(), 40.0);
        task.advance(5000);
        assert_eq!(task.bytes_transferred, 1000);

        let mut unknown = TransferTask::new(TransferDirection::Download, "/srv/d", "/tmp", 0);
        unknown.start();
        unknown.advance(10);
        assert_eq!(unknown.bytes_transferred, 0);
        assert_eq!(unknown.progress_percent(), 0.0);
    }

    #[test]
    fn status_texts() {
        let mut task = TransferTask::new(TransferDirection::Upload, "/tmp/a", "/srv", 2048);
        assert_eq!(task.status_text(), "Waiting...");
        task.start();
        task.advance(512);
        assert_eq!(task.status_text(), "25.0% (512 B/2 KB)");
        task.fail("Permission denied: /srv");
        assert_eq!(task.status_text(), "Failed: Permission denied: /srv");

        let mut done = TransferTask::new(TransferDirection::Upload, "/tmp/b", "/srv", 1536);
        done.start();
        done.complete();
        assert_eq!(done.status_text(), "Completed (1.5 KB)");
    }
}
