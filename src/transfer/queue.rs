//! Background transfer queue
//!
//! One worker task scans for the oldest pending task, takes a permit and
//! spawns the task's job on the blocking pool. With nothing pending it
//! sleeps for the poll interval and scans again.

use super::progress::{ProgressSink, TransferProgress};
use super::task::{TransferDirection, TransferStatus, TransferTask};
use super::TransferEngine;
use crate::error::{XferError, XferResult};
use crate::listing::FileEntry;
use crate::ssh::SharedSession;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Work run for one queued task on the blocking pool
pub type Job = Box<dyn FnOnce(&JobContext) -> XferResult<()> + Send + 'static>;

struct QueueEntry {
    task: TransferTask,
    job: Option<Job>,
    cancel: CancellationToken,
}

type Entries = Arc<Mutex<Vec<QueueEntry>>>;

/// Handed to a running job: its cancellation token and byte progress
pub struct JobContext {
    task_id: String,
    cancel: CancellationToken,
    entries: Entries,
}

impl JobContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl ProgressSink for JobContext {
    fn report(&self, progress: TransferProgress) {
        tracing::debug!("Task {}: {}", self.task_id, progress.message);
    }

    fn bytes(&self, count: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.task.id == self.task_id) {
            entry.task.advance(count);
        }
    }
}

/// Ordered transfer tasks plus the worker that runs them
pub struct TransferQueue {
    entries: Entries,
    engine: TransferEngine,
    shutdown: CancellationToken,
    poll_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferQueue {
    /// Start the worker loop; must be called from within a tokio runtime
    pub fn start(engine: TransferEngine) -> Self {
        let entries: Entries = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(engine.settings().max_concurrent.max(1)));
        let poll_interval = engine.settings().poll_interval();

        let worker = tokio::spawn(run_worker(
            entries.clone(),
            permits,
            poll_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            "Transfer queue started ({} concurrent)",
            engine.settings().max_concurrent
        );

        Self {
            entries,
            engine,
            shutdown,
            poll_interval,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Queue `job` under `task`; returns the task id
    pub fn enqueue(&self, task: TransferTask, job: Job) -> String {
        let id = task.id.clone();
        tracing::debug!("Queued {:?} task {} ({})", task.direction, id, task.file_name);
        self.entries.lock().push(QueueEntry {
            task,
            job: Some(job),
            cancel: CancellationToken::new(),
        });
        id
    }

    pub fn enqueue_upload(&self, session: SharedSession, local_path: PathBuf, dest_dir: String) -> String {
        let total = super::walk::scan_local_sources(std::slice::from_ref(&local_path))
            .iter()
            .map(|item| item.size)
            .sum();
        let task = TransferTask::new(
            TransferDirection::Upload,
            local_path.display().to_string(),
            dest_dir.clone(),
            total,
        );
        let engine = self.engine.clone();
        self.enqueue(
            task,
            Box::new(move |ctx: &JobContext| {
                let session = session.lock();
                engine
                    .upload(&session, &[local_path], &dest_dir, ctx, ctx.cancel_token())
                    .map(|_| ())
            }),
        )
    }

    /// Directories are queued with an unknown total
    pub fn enqueue_download(&self, session: SharedSession, item: FileEntry, dest_local_dir: PathBuf) -> String {
        let total = if item.is_dir { 0 } else { item.size };
        let task = TransferTask::new(
            TransferDirection::Download,
            item.path.clone(),
            dest_local_dir.display().to_string(),
            total,
        );
        let engine = self.engine.clone();
        self.enqueue(
            task,
            Box::new(move |ctx: &JobContext| {
                let session = session.lock();
                engine
                    .download(&session, &[item], &dest_local_dir, ctx, ctx.cancel_token())
                    .map(|_| ())
            }),
        )
    }

    pub fn enqueue_server_to_server(
        &self,
        source: SharedSession,
        dest: SharedSession,
        item: FileEntry,
        dest_dir: String,
    ) -> String {
        let total = if item.is_dir { 0 } else { item.size };
        let task = TransferTask::new(
            TransferDirection::ServerToServer,
            item.path.clone(),
            dest_dir.clone(),
            total,
        );
        let engine = self.engine.clone();
        self.enqueue(
            task,
            Box::new(move |ctx: &JobContext| {
                let summary = engine.transfer_between_shared(
                    &source,
                    &dest,
                    &[item],
                    &dest_dir,
                    ctx,
                    ctx.cancel_token(),
                )?;
                match summary.failed_files.first() {
                    Some((path, error)) => Err(XferError::Transfer(format!(
                        "{} file(s) failed, first {}: {}",
                        summary.failed_files.len(),
                        path,
                        error
                    ))),
                    None => Ok(()),
                }
            }),
        )
    }

    /// Cancel a pending or running task
    pub fn cancel(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.task.id == id) else {
            return false;
        };
        if !entry.task.cancel() {
            return false;
        }
        entry.cancel.cancel();
        entry.job = None;
        tracing::info!("Cancelled task {}", id);
        true
    }

    pub fn get(&self, id: &str) -> Option<TransferTask> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.task.id == id)
            .map(|e| e.task.clone())
    }

    /// All tasks in queue order
    pub fn snapshot(&self) -> Vec<TransferTask> {
        self.entries.lock().iter().map(|e| e.task.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.task.status == TransferStatus::InProgress)
            .count()
    }

    /// Drop completed, failed and cancelled tasks; returns how many went
    pub fn clear_finished(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !e.task.status.is_finished());
        before - entries.len()
    }

    /// Wait until no task is pending or in progress
    pub async fn wait_idle(&self) {
        loop {
            let busy = self
                .entries
                .lock()
                .iter()
                .any(|e| !e.task.status.is_finished());
            if !busy {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop the worker and cancel everything still queued or running
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|e| !e.task.status.is_finished())
            .map(|e| e.task.id.clone())
            .collect();
        for id in ids {
            self.cancel(&id);
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        tracing::info!("Transfer queue stopped");
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn next_pending(entries: &Entries) -> Option<String> {
    entries
        .lock()
        .iter()
        .find(|e| e.task.status == TransferStatus::Pending && e.job.is_some())
        .map(|e| e.task.id.clone())
}

/// Mark the task started and hand out its job, unless it left pending meanwhile
fn claim(entries: &Entries, id: &str) -> Option<(Job, CancellationToken)> {
    let mut entries = entries.lock();
    let entry = entries.iter_mut().find(|e| e.task.id == id)?;
    if !entry.task.start() {
        return None;
    }
    let job = entry.job.take()?;
    Some((job, entry.cancel.clone()))
}

fn finish(entries: &Entries, id: &str, result: XferResult<()>) {
    let mut entries = entries.lock();
    let Some(entry) = entries.iter_mut().find(|e| e.task.id == id) else {
        return;
    };

    match result {
        Ok(()) => {
            if entry.task.complete() {
                tracing::info!("Task {} completed ({})", id, entry.task.file_name);
            }
        }
        Err(e) if e.is_cancelled() || entry.cancel.is_cancelled() => {
            entry.task.cancel();
            tracing::info!("Task {} cancelled", id);
        }
        Err(e) => {
            let message = crate::logging::sanitize(&e.to_string());
            tracing::error!("Task {} failed: {}", id, message);
            entry.task.fail(message);
        }
    }
}

async fn run_worker(
    entries: Entries,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let id = match next_pending(&entries) {
            Some(id) => id,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }
        };

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit,
            _ = shutdown.cancelled() => break,
        };
        let Ok(permit) = permit else {
            break;
        };

        let Some((job, cancel)) = claim(&entries, &id) else {
            continue;
        };

        let ctx = JobContext {
            task_id: id.clone(),
            cancel,
            entries: entries.clone(),
        };
        let done = entries.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || job(&ctx))
                .await
                .unwrap_or_else(|e| Err(XferError::Transfer(format!("Transfer job aborted: {}", e))));
            finish(&done, &id, result);
            drop(permit);
        });
    }
    tracing::debug!("Transfer worker loop exited");
}
