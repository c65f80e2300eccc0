//! Single-file transfers that pick up where a previous attempt stopped

use super::integrity::{self, IntegrityCheck};
use super::progress::ProgressSink;
use crate::config::TransferSettings;
use crate::error::{XferError, XferResult};
use crate::sftp::{remote_parent, RemoteFs, WriteMode};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    /// Bytes moved by this attempt, not counting resumed content
    pub bytes_written: u64,
    /// Offset the copy started from when an earlier partial copy was kept
    pub resumed_from: Option<u64>,
    pub integrity: Option<IntegrityCheck>,
}

/// Copy `reader` into `writer` one chunk at a time, checking `cancel` between chunks
pub fn copy_chunked(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> XferResult<u64> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;

    loop {
        if cancel.is_cancelled() {
            writer.flush()?;
            return Err(XferError::Cancelled);
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        progress.bytes(n as u64);
    }

    writer.flush()?;
    Ok(copied)
}

/// Create every missing directory on the way to `dir`
pub fn ensure_remote_dir_chain(remote: &dyn RemoteFs, dir: &str) -> XferResult<()> {
    if dir.is_empty() || dir == "." || dir == "/" {
        return Ok(());
    }

    let mut current = if dir.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };

    for segment in dir.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);

        match remote.stat(&current) {
            Ok(stat) if stat.is_dir => continue,
            Ok(_) => {
                return Err(XferError::Transfer(format!(
                    "{} exists and is not a directory",
                    current
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = remote.mkdir(&current) {
            // Another transfer may have created it in between
            match remote.stat(&current) {
                Ok(stat) if stat.is_dir => {
                    tracing::debug!("Directory {} appeared concurrently", current);
                }
                _ => return Err(e),
            }
        } else {
            tracing::debug!("Created remote directory {}", current);
        }
    }
    Ok(())
}

/// Upload one file, appending to a shorter remote copy when there is one
pub fn upload_file(
    remote: &dyn RemoteFs,
    local_path: &Path,
    remote_path: &str,
    settings: &TransferSettings,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> XferResult<FileOutcome> {
    if let Some(parent) = remote_parent(remote_path) {
        ensure_remote_dir_chain(remote, parent)?;
    }

    let local_size = std::fs::metadata(local_path)?.len();
    let remote_size = match remote.stat(remote_path) {
        Ok(stat) => stat.size,
        Err(e) => {
            if !e.is_not_found() {
                tracing::debug!("Cannot stat {} before upload: {}", remote_path, e);
            }
            0
        }
    };

    let mut local = File::open(local_path)?;
    let resumed_from = if remote_size > 0 && remote_size < local_size {
        tracing::info!(
            "Resuming upload of {} at {}/{} bytes",
            remote_path,
            remote_size,
            local_size
        );
        local.seek(SeekFrom::Start(remote_size))?;
        progress.bytes(remote_size);
        Some(remote_size)
    } else {
        None
    };

    let mode = resumed_from.map_or(WriteMode::Truncate, WriteMode::Resume);
    let bytes_written = {
        let mut writer = remote.open_write(remote_path, mode)?;
        copy_chunked(&mut local, &mut writer, settings.chunk_size, cancel, progress)?
    };

    let integrity = (settings.verify_integrity && local_size > settings.verify_threshold)
        .then(|| integrity::verify(remote, local_path, remote_path));

    Ok(FileOutcome {
        bytes_written,
        resumed_from,
        integrity,
    })
}

/// Download one file of known `remote_size`, appending to a shorter local copy
pub fn download_file(
    remote: &dyn RemoteFs,
    remote_path: &str,
    remote_size: u64,
    local_path: &Path,
    settings: &TransferSettings,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> XferResult<FileOutcome> {
    if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let local_size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);

    let (mut local, resumed_from) = if local_size > 0 && local_size < remote_size {
        tracing::info!(
            "Resuming download of {} at {}/{} bytes",
            remote_path,
            local_size,
            remote_size
        );
        progress.bytes(local_size);
        (
            OpenOptions::new().append(true).open(local_path)?,
            Some(local_size),
        )
    } else {
        (File::create(local_path)?, None)
    };

    let bytes_written = {
        let mut reader = remote.open_read(remote_path, resumed_from.unwrap_or(0))?;
        copy_chunked(&mut reader, &mut local, settings.chunk_size, cancel, progress)?
    };
    local.sync_all()?;

    let integrity = (settings.verify_integrity && remote_size > settings.verify_threshold)
        .then(|| integrity::verify(remote, local_path, remote_path));

    Ok(FileOutcome {
        bytes_written,
        resumed_from,
        integrity,
    })
}

/// Stream a file from one remote straight into another, replacing the destination
pub fn copy_remote_file(
    source: &dyn RemoteFs,
    source_path: &str,
    dest: &dyn RemoteFs,
    dest_path: &str,
    settings: &TransferSettings,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> XferResult<FileOutcome> {
    let mut reader = source.open_read(source_path, 0)?;
    let mut writer = dest.open_write(dest_path, WriteMode::Truncate)?;
    let bytes_written = copy_chunked(&mut reader, &mut writer, settings.chunk_size, cancel, progress)?;

    Ok(FileOutcome {
        bytes_written,
        resumed_from: None,
        integrity: None,
    })
}
