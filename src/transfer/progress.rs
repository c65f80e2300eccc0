use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Progress of a multi-item operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub current_item_name: String,
    pub items_processed: usize,
    /// `None` while the item count is unknown (recursive remote scans)
    pub total_items: Option<usize>,
    pub message: String,
}

impl TransferProgress {
    pub fn item(name: impl Into<String>, processed: usize, total: Option<usize>) -> Self {
        let name = name.into();
        let message = match total {
            Some(total) => format!("{} ({}/{})", name, processed, total),
            None => format!("{} ({})", name, processed),
        };
        Self {
            current_item_name: name,
            items_processed: processed,
            total_items: total,
            message,
        }
    }
}

/// Receives progress reports
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: TransferProgress);

    /// Called after every copied chunk, and once with the kept prefix on resume
    fn bytes(&self, _count: u64) {}
}

impl<F> ProgressSink for F
where
    F: Fn(TransferProgress) + Send + Sync,
{
    fn report(&self, progress: TransferProgress) {
        self(progress)
    }
}

/// Discards reports
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: TransferProgress) {}
}

/// Forward reports into a channel; a closed receiver is ignored
pub fn channel_sink(tx: UnboundedSender<TransferProgress>) -> impl ProgressSink {
    move |progress: TransferProgress| {
        let _ = tx.send(progress);
    }
}
