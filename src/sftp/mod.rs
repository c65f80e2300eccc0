//! Remote file access
//!
//! `RemoteFs` is the capability every session exposes: directory listing,
//! positioned byte streams, attribute changes and one-shot commands.
//! `SftpConnection` implements it over libssh2.

pub mod ops;

use crate::error::{XferError, XferResult};
use ssh2::{FileStat, OpenFlags, OpenType, Session as Ssh2Session, Sftp};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Attributes of a remote path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub modified: Option<i64>,
    pub perm: Option<u32>,
}

impl From<&FileStat> for RemoteStat {
    fn from(stat: &FileStat) -> Self {
        Self {
            is_dir: stat.is_dir(),
            size: stat.size.unwrap_or(0),
            modified: stat.mtime.map(|t| t as i64),
            perm: stat.perm,
        }
    }
}

/// One raw directory entry, `.` and `..` included
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub path: String,
    pub stat: RemoteStat,
}

impl RemoteDirEntry {
    pub fn is_pseudo(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// How a remote file is opened for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate, write from zero
    Truncate,
    /// Keep existing content, write from the given offset
    Resume(u64),
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// File-level access to one remote endpoint.
///
/// Implementations are not expected to tolerate concurrent use; callers keep
/// one in-flight operation per session.
pub trait RemoteFs: Send {
    fn read_dir(&self, path: &str) -> XferResult<Vec<RemoteDirEntry>>;
    fn stat(&self, path: &str) -> XferResult<RemoteStat>;
    fn mkdir(&self, path: &str) -> XferResult<()>;
    fn open_read(&self, path: &str, offset: u64) -> XferResult<Box<dyn Read + '_>>;
    fn open_write(&self, path: &str, mode: WriteMode) -> XferResult<Box<dyn Write + '_>>;
    fn rename(&self, from: &str, to: &str) -> XferResult<()>;
    fn remove_file(&self, path: &str) -> XferResult<()>;
    fn remove_dir(&self, path: &str) -> XferResult<()>;
    fn set_mode(&self, path: &str, mode: u32) -> XferResult<()>;
    fn exec(&self, command: &str) -> XferResult<CommandOutput>;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
}

/// Join a remote directory and a child name with `/`
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last segment of a remote path
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Parent of a remote path, `None` at the root
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&trimmed[..i]),
    }
}

/// An authenticated SFTP channel plus the session that carries it
pub struct SftpConnection {
    session: Ssh2Session,
    sftp: Option<Sftp>,
    label: String,
}

impl SftpConnection {
    /// Open the SFTP subsystem on an authenticated session
    pub fn open(session: Ssh2Session, label: String) -> XferResult<Self> {
        let sftp = session
            .sftp()
            .map_err(|e| XferError::Connection(format!("Failed to open SFTP: {}", e)))?;

        Ok(Self {
            session,
            sftp: Some(sftp),
            label,
        })
    }

    fn sftp(&self) -> XferResult<&Sftp> {
        self.keepalive();
        self.sftp
            .as_ref()
            .ok_or_else(|| XferError::Connection(format!("SFTP session closed: {}", self.label)))
    }

    fn keepalive(&self) {
        if let Err(e) = self.session.keepalive_send() {
            tracing::debug!("Keepalive send failed ({}): {}", self.label, e);
        }
    }
}

impl RemoteFs for SftpConnection {
    fn read_dir(&self, path: &str) -> XferResult<Vec<RemoteDirEntry>> {
        let path = if path.is_empty() { "." } else { path };
        let entries = self.sftp()?.readdir(Path::new(path))?;

        Ok(entries
            .into_iter()
            .map(|(file_path, stat)| RemoteDirEntry {
                name: file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path: file_path.to_string_lossy().to_string(),
                stat: RemoteStat::from(&stat),
            })
            .collect())
    }

    fn stat(&self, path: &str) -> XferResult<RemoteStat> {
        let stat = self.sftp()?.stat(Path::new(path))?;
        Ok(RemoteStat::from(&stat))
    }

    fn mkdir(&self, path: &str) -> XferResult<()> {
        self.sftp()?.mkdir(Path::new(path), 0o755)?;
        Ok(())
    }

    fn open_read(&self, path: &str, offset: u64) -> XferResult<Box<dyn Read + '_>> {
        let mut file = self.sftp()?.open(Path::new(path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str, mode: WriteMode) -> XferResult<Box<dyn Write + '_>> {
        let sftp = self.sftp()?;
        let file = match mode {
            WriteMode::Truncate => sftp.create(Path::new(path))?,
            WriteMode::Resume(offset) => {
                let mut file = sftp.open_mode(
                    Path::new(path),
                    OpenFlags::WRITE | OpenFlags::CREATE,
                    0o644,
                    OpenType::File,
                )?;
                file.seek(SeekFrom::Start(offset))?;
                file
            }
        };
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> XferResult<()> {
        self.sftp()?.rename(Path::new(from), Path::new(to), None)?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> XferResult<()> {
        self.sftp()?.unlink(Path::new(path))?;
        Ok(())
    }

    fn remove_dir(&self, path: &str) -> XferResult<()> {
        self.sftp()?.rmdir(Path::new(path))?;
        Ok(())
    }

    fn set_mode(&self, path: &str, mode: u32) -> XferResult<()> {
        let sftp = self.sftp()?;
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        sftp.setstat(Path::new(path), stat)?;
        Ok(())
    }

    fn exec(&self, command: &str) -> XferResult<CommandOutput> {
        self.keepalive();
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| XferError::Connection(format!("Failed to open channel: {}", e)))?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn is_connected(&self) -> bool {
        self.sftp.is_some() && self.session.authenticated()
    }

    fn disconnect(&mut self) {
        // Sftp must go before the session it rides on
        if self.sftp.take().is_some() {
            if let Err(e) = self
                .session
                .disconnect(None, "closing session", None)
            {
                tracing::debug!("Disconnect of {} failed: {}", self.label, e);
            }
            tracing::debug!("SFTP session closed: {}", self.label);
        }
    }
}

impl Drop for SftpConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Format file permissions as a string like "rwxr-xr-x"
pub fn format_permissions(perm: u32, is_dir: bool) -> String {
    let mut s = String::with_capacity(10);
    s.push(if is_dir { 'd' } else { '-' });

    for shift in [6, 3, 0] {
        let bits = (perm >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_helpers() {
        assert_eq!(join_remote("/srv", "a.txt"), "/srv/a.txt");
        assert_eq!(join_remote("/srv/", "a.txt"), "/srv/a.txt");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
        assert_eq!(remote_file_name("/srv/data/"), "data");
        assert_eq!(remote_file_name("file"), "file");
        assert_eq!(remote_parent("/srv/data/x.bin"), Some("/srv/data"));
        assert_eq!(remote_parent("/srv"), Some("/"));
        assert_eq!(remote_parent("/"), None);
        assert_eq!(remote_parent("relative"), None);
    }

    #[test]
    fn permission_string() {
        assert_eq!(format_permissions(0o755, true), "drwxr-xr-x");
        assert_eq!(format_permissions(0o640, false), "-rw-r-----");
    }
}
