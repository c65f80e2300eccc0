//! Transfer engine
//!
//! Moves files between the local disk and a remote session, or between two
//! remote sessions without staging locally. Single files resume from a
//! shorter partial copy; large files are checked with SHA-256 afterwards.
//! `TransferQueue` runs these operations in the background under a fixed
//! number of permits.

pub mod integrity;
pub mod progress;
pub mod queue;
pub mod resume;
pub mod task;
pub mod walk;

pub use integrity::{IntegrityCheck, IntegrityWarning};
pub use progress::{channel_sink, NoProgress, ProgressSink, TransferProgress};
pub use queue::{Job, JobContext, TransferQueue};
pub use resume::FileOutcome;
pub use task::{TransferDirection, TransferStatus, TransferTask};

use crate::config::TransferSettings;
use crate::error::{XferError, XferResult};
use crate::listing::{read_remote_dir, FileEntry};
use crate::sftp::RemoteFs;
use crate::ssh::{Session, SharedSession};
use parking_lot::MutexGuard;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human size with up to two decimals: `512 B`, `1.5 KB`, `3 MB`
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let number = format!("{:.2}", value);
    let number = number.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", number, UNITS[unit])
}

/// Result of one upload, download or server-to-server run
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferSummary {
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub resumed_files: usize,
    /// Remote directories whose listing failed and were not descended into
    pub skipped_dirs: Vec<String>,
    /// Files that failed without stopping the run, with the error text
    pub failed_files: Vec<(String, String)>,
    pub integrity_warnings: Vec<IntegrityWarning>,
}

impl TransferSummary {
    fn record(&mut self, outcome: FileOutcome) {
        self.files_transferred += 1;
        self.bytes_transferred += outcome.bytes_written;
        if outcome.resumed_from.is_some() {
            self.resumed_files += 1;
        }
        if let Some(IntegrityCheck::Mismatch(warning)) = outcome.integrity {
            self.integrity_warnings.push(warning);
        }
    }
}

/// Runs transfers against connected sessions
#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    settings: TransferSettings,
}

struct Walk<'a> {
    cancel: &'a CancellationToken,
    progress: &'a dyn ProgressSink,
    counter: usize,
    summary: TransferSummary,
}

impl<'a> Walk<'a> {
    fn new(cancel: &'a CancellationToken, progress: &'a dyn ProgressSink) -> Self {
        Self {
            cancel,
            progress,
            counter: 0,
            summary: TransferSummary::default(),
        }
    }

    fn check_cancel(&self) -> XferResult<()> {
        if self.cancel.is_cancelled() {
            Err(XferError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn next_item(&mut self, name: &str, verb: &str) {
        self.counter += 1;
        let mut report = TransferProgress::item(name, self.counter, None);
        report.message = format!("{} {}...", verb, name);
        self.progress.report(report);
    }
}

fn connected_remote(session: &Session) -> XferResult<&dyn RemoteFs> {
    if !session.is_connected() {
        return Err(XferError::Connection(format!(
            "Session to {} is not connected",
            session.endpoint()
        )));
    }
    session.remote()
}

impl TransferEngine {
    pub fn new(settings: TransferSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Upload local files and directory trees into `dest_dir`.
    ///
    /// Sources are scanned first so the item total is known. The first file
    /// error stops the run.
    pub fn upload(
        &self,
        session: &Session,
        source_paths: &[PathBuf],
        dest_dir: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> XferResult<TransferSummary> {
        let remote = connected_remote(session)?;
        let items = walk::scan_local_sources(source_paths);
        let total = items.len();
        let mut summary = TransferSummary::default();

        tracing::info!("Uploading {} file(s) to {}:{}", total, session.endpoint(), dest_dir);

        for (index, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(XferError::Cancelled);
            }

            let remote_path = walk::remote_destination(dest_dir, &item.relative);
            let name = item
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| item.relative.clone());
            let mut report = TransferProgress::item(&name, index + 1, Some(total));
            report.message = format!("Uploading {}...", name);
            progress.report(report);

            let outcome = resume::upload_file(
                remote,
                &item.local_path,
                &remote_path,
                &self.settings,
                cancel,
                progress,
            )
            .map_err(|e| {
                tracing::error!("Upload of {} failed: {}", item.local_path.display(), e);
                e
            })?;
            summary.record(outcome);
        }

        tracing::info!(
            "Upload finished: {} file(s), {}",
            summary.files_transferred,
            format_bytes(summary.bytes_transferred)
        );
        Ok(summary)
    }

    /// Download remote files and directories into `dest_local_dir`.
    ///
    /// Directories are recreated locally; a subdirectory that cannot be
    /// listed for lack of permission is skipped. The item total is unknown.
    pub fn download(
        &self,
        session: &Session,
        remote_items: &[FileEntry],
        dest_local_dir: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> XferResult<TransferSummary> {
        let remote = connected_remote(session)?;
        let mut walk = Walk::new(cancel, progress);

        tracing::info!(
            "Downloading {} item(s) from {} to {}",
            remote_items.len(),
            session.endpoint(),
            dest_local_dir.display()
        );

        for item in remote_items {
            walk.check_cancel()?;
            self.download_entry(remote, item, dest_local_dir, &mut walk)?;
        }

        tracing::info!(
            "Download finished: {} file(s), {}",
            walk.summary.files_transferred,
            format_bytes(walk.summary.bytes_transferred)
        );
        Ok(walk.summary)
    }

    fn download_entry(
        &self,
        remote: &dyn RemoteFs,
        item: &FileEntry,
        local_dir: &Path,
        walk: &mut Walk<'_>,
    ) -> XferResult<()> {
        let target = local_dir.join(&item.name);

        if !item.is_dir {
            walk.next_item(&item.name, "Downloading");
            let outcome = resume::download_file(
                remote,
                &item.path,
                item.size,
                &target,
                &self.settings,
                walk.cancel,
                walk.progress,
            )
            .map_err(|e| {
                tracing::error!("Download of {} failed: {}", item.path, e);
                e
            })?;
            walk.summary.record(outcome);
            return Ok(());
        }

        std::fs::create_dir_all(&target)?;
        let children = match read_remote_dir(remote, &item.path) {
            Ok(children) => children,
            Err(e) if e.is_permission_denied() => {
                tracing::warn!("Access denied to {}, skipping", item.path);
                walk.summary.skipped_dirs.push(item.path.clone());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for child in &children {
            walk.check_cancel()?;
            self.download_entry(remote, child, &target, walk)?;
        }
        Ok(())
    }

    /// Copy remote items from `source` into `dest_dir` on `dest`.
    ///
    /// Bytes stream directly between the two sessions. Listing failures skip
    /// their subtree and file failures are recorded in the summary; only
    /// cancellation ends the run early.
    pub fn transfer_between_servers(
        &self,
        source: &Session,
        dest: &Session,
        source_items: &[FileEntry],
        dest_dir: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> XferResult<TransferSummary> {
        let source_remote = connected_remote(source)?;
        let dest_remote = connected_remote(dest)?;
        self.copy_between(source_remote, dest_remote, source_items, dest_dir, progress, cancel)
    }

    fn copy_between(
        &self,
        source: &dyn RemoteFs,
        dest: &dyn RemoteFs,
        source_items: &[FileEntry],
        dest_dir: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> XferResult<TransferSummary> {
        let mut walk = Walk::new(cancel, progress);
        for item in source_items {
            walk.check_cancel()?;
            self.copy_entry(source, dest, item, dest_dir, &mut walk)?;
        }

        tracing::info!(
            "Server-to-server copy finished: {} file(s), {} failed, {} skipped dir(s)",
            walk.summary.files_transferred,
            walk.summary.failed_files.len(),
            walk.summary.skipped_dirs.len()
        );
        Ok(walk.summary)
    }

    fn copy_entry(
        &self,
        source: &dyn RemoteFs,
        dest: &dyn RemoteFs,
        item: &FileEntry,
        dest_dir: &str,
        walk: &mut Walk<'_>,
    ) -> XferResult<()> {
        let dest_path = walk::remote_destination(dest_dir, &item.name);

        if !item.is_dir {
            walk.next_item(&item.name, "Copying");
            match resume::copy_remote_file(
                source,
                &item.path,
                dest,
                &dest_path,
                &self.settings,
                walk.cancel,
                walk.progress,
            ) {
                Ok(outcome) => walk.summary.record(outcome),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!("Copy of {} to {} failed: {}", item.path, dest_path, e);
                    walk.summary.failed_files.push((item.path.clone(), e.to_string()));
                }
            }
            return Ok(());
        }

        if let Err(e) = dest.mkdir(&dest_path) {
            tracing::debug!("mkdir {} on destination: {}", dest_path, e);
        }

        let children = match read_remote_dir(source, &item.path) {
            Ok(children) => children,
            Err(e) => {
                tracing::warn!("Cannot list source {}, skipping: {}", item.path, e);
                walk.summary.skipped_dirs.push(item.path.clone());
                return Ok(());
            }
        };

        for child in &children {
            walk.check_cancel()?;
            self.copy_entry(source, dest, child, &dest_path, walk)?;
        }
        Ok(())
    }

    pub async fn upload_async(
        &self,
        session: SharedSession,
        source_paths: Vec<PathBuf>,
        dest_dir: String,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> XferResult<TransferSummary> {
        let engine = self.clone();
        run_blocking(move || {
            let session = session.lock();
            engine.upload(&session, &source_paths, &dest_dir, progress.as_ref(), &cancel)
        })
        .await
    }

    pub async fn download_async(
        &self,
        session: SharedSession,
        remote_items: Vec<FileEntry>,
        dest_local_dir: PathBuf,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> XferResult<TransferSummary> {
        let engine = self.clone();
        run_blocking(move || {
            let session = session.lock();
            engine.download(&session, &remote_items, &dest_local_dir, progress.as_ref(), &cancel)
        })
        .await
    }

    /// Lock both sessions for the whole run and copy. Passing the same
    /// session twice copies within one host.
    pub fn transfer_between_shared(
        &self,
        source: &SharedSession,
        dest: &SharedSession,
        source_items: &[FileEntry],
        dest_dir: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> XferResult<TransferSummary> {
        if Arc::ptr_eq(source, dest) {
            let session = source.lock();
            let remote = connected_remote(&session)?;
            return self.copy_between(remote, remote, source_items, dest_dir, progress, cancel);
        }
        let (source, dest) = lock_pair(source, dest);
        self.transfer_between_servers(&source, &dest, source_items, dest_dir, progress, cancel)
    }

    pub async fn transfer_between_servers_async(
        &self,
        source: SharedSession,
        dest: SharedSession,
        source_items: Vec<FileEntry>,
        dest_dir: String,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> XferResult<TransferSummary> {
        let engine = self.clone();
        run_blocking(move || {
            engine.transfer_between_shared(
                &source,
                &dest,
                &source_items,
                &dest_dir,
                progress.as_ref(),
                &cancel,
            )
        })
        .await
    }
}

/// Lock two distinct sessions in address order so crossed copies
/// (A to B alongside B to A) cannot deadlock. Guards come back as
/// (first, second) of the arguments.
fn lock_pair<'a>(
    first: &'a SharedSession,
    second: &'a SharedSession,
) -> (MutexGuard<'a, Session>, MutexGuard<'a, Session>) {
    if Arc::as_ptr(first) < Arc::as_ptr(second) {
        let a = first.lock();
        let b = second.lock();
        (a, b)
    } else {
        let b = second.lock();
        let a = first.lock();
        (a, b)
    }
}

async fn run_blocking<T, F>(f: F) -> XferResult<T>
where
    F: FnOnce() -> XferResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| XferError::Transfer(format!("Transfer worker failed: {}", e)))?
}
