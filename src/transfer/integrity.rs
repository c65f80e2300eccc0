//! Post-transfer SHA-256 comparison between a local file and its remote copy

use crate::error::{XferError, XferResult};
use crate::sftp::{ops::shell_quote, RemoteFs};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const HASH_BUFFER: usize = 80 * 1024;

/// Advisory record of a hash mismatch; never turns a transfer into a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityWarning {
    pub local_path: String,
    pub remote_path: String,
    pub local_hash: String,
    pub remote_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntegrityCheck {
    Verified,
    Mismatch(IntegrityWarning),
    /// A hash could not be computed on one side
    Unavailable { reason: String },
}

impl IntegrityCheck {
    pub fn warning(&self) -> Option<&IntegrityWarning> {
        match self {
            IntegrityCheck::Mismatch(w) => Some(w),
            _ => None,
        }
    }
}

/// Lowercase hex SHA-256 of a local file, read in chunks
pub fn sha256_file(path: &Path) -> XferResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// First token of `sha256sum <path>` on the remote side
pub fn remote_sha256(remote: &dyn RemoteFs, path: &str) -> XferResult<String> {
    let output = remote.exec(&format!("sha256sum {}", shell_quote(path)))?;
    if !output.success() {
        return Err(XferError::Transfer(format!(
            "sha256sum failed for {}: {}",
            path,
            output.stderr.trim()
        )));
    }
    output
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| XferError::Transfer(format!("sha256sum returned nothing for {}", path)))
}

/// Compare both hashes; a mismatch is logged and returned, not raised
pub fn verify(remote: &dyn RemoteFs, local_path: &Path, remote_path: &str) -> IntegrityCheck {
    let local_hash = match sha256_file(local_path) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("Cannot hash {}: {}", local_path.display(), e);
            return IntegrityCheck::Unavailable {
                reason: e.to_string(),
            };
        }
    };
    let remote_hash = match remote_sha256(remote, remote_path) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("Cannot hash remote {}: {}", remote_path, e);
            return IntegrityCheck::Unavailable {
                reason: e.to_string(),
            };
        }
    };

    if local_hash.eq_ignore_ascii_case(&remote_hash) {
        tracing::debug!("Checksum OK: {}", remote_path);
        IntegrityCheck::Verified
    } else {
        let warning = IntegrityWarning {
            local_path: local_path.display().to_string(),
            remote_path: remote_path.to_string(),
            local_hash,
            remote_hash,
        };
        tracing::warn!(
            "IntegrityWarning: checksum mismatch for {} (local {}, remote {})",
            warning.remote_path,
            warning.local_hash,
            warning.remote_hash
        );
        IntegrityCheck::Mismatch(warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRemote;

    #[test]
    fn matching_hashes_verify() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"payload").unwrap();

        let remote = MockRemote::new();
        remote.add_file("/srv/a.bin", b"payload");
        assert_eq!(verify(&remote, &local, "/srv/a.bin"), IntegrityCheck::Verified);
        assert_eq!(
            remote.commands(),
            vec!["sha256sum '/srv/a.bin'".to_string()]
        );
    }

    #[test]
    fn hash_comparison_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"payload").unwrap();

        let remote = MockRemote::new();
        remote.add_file("/srv/a.bin", b"payload");
        let upper = sha256_file(&local).unwrap().to_uppercase();
        remote.override_hash("/srv/a.bin", &upper);
        assert_eq!(verify(&remote, &local, "/srv/a.bin"), IntegrityCheck::Verified);
    }

    #[test]
    fn mismatch_and_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"payload").unwrap();

        let remote = MockRemote::new();
        remote.add_file("/srv/a.bin", b"corrupted");
        let check = verify(&remote, &local, "/srv/a.bin");
        let warning = check.warning().unwrap();
        assert_ne!(warning.local_hash, warning.remote_hash);

        remote.set_command_result(
            "sha256sum '/srv/a.bin'",
            crate::sftp::CommandOutput {
                stdout: String::new(),
                stderr: "sha256sum: command not found".into(),
                exit_code: 127,
            },
        );
        assert!(matches!(
            verify(&remote, &local, "/srv/a.bin"),
            IntegrityCheck::Unavailable { .. }
        ));
    }
}
