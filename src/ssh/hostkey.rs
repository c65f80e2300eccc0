use crate::error::{XferError, XferResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session as Ssh2Session};
use std::path::PathBuf;

/// How server host keys are checked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Any key is accepted without checking
    #[default]
    AcceptAny,
    /// Unknown hosts are recorded, changed keys are refused
    TrustOnFirstUse { known_hosts: PathBuf },
    /// Only keys with one of these `SHA256:` fingerprints are accepted
    Pinned { fingerprints: Vec<String> },
}

impl HostKeyPolicy {
    pub fn verify(&self, session: &Ssh2Session, host: &str, port: u16) -> XferResult<()> {
        if let HostKeyPolicy::AcceptAny = self {
            return Ok(());
        }

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| XferError::Connection("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        match self {
            HostKeyPolicy::AcceptAny => Ok(()),
            HostKeyPolicy::Pinned { fingerprints } => {
                check_pinned(fingerprints, &fingerprint, host, port)
            }
            HostKeyPolicy::TrustOnFirstUse { known_hosts } => {
                let mut hosts = session
                    .known_hosts()
                    .map_err(|e| XferError::Connection(format!("Failed to create known_hosts: {}", e)))?;

                if known_hosts.exists() {
                    let _ = hosts.read_file(known_hosts, KnownHostFileKind::OpenSSH);
                }

                match hosts.check_port(host, port, key) {
                    CheckResult::Match => {
                        tracing::debug!("Host key matched for {}:{}", host, port);
                        Ok(())
                    }
                    CheckResult::NotFound => {
                        tracing::info!(
                            "Recording new {} host key for {}:{} ({})",
                            key_type_name(key_type),
                            host,
                            port,
                            fingerprint
                        );
                        hosts
                            .add(
                                &known_hosts_name(host, port),
                                key,
                                &format!("Added by remote-xfer on {}", chrono::Utc::now()),
                                KnownHostKeyFormat::from(key_type),
                            )
                            .map_err(|e| XferError::Connection(format!("Failed to add known host: {}", e)))?;

                        if let Some(parent) = known_hosts.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        hosts
                            .write_file(known_hosts, KnownHostFileKind::OpenSSH)
                            .map_err(|e| XferError::Connection(format!("Failed to write known_hosts: {}", e)))?;
                        Ok(())
                    }
                    CheckResult::Mismatch => {
                        tracing::error!("HOST KEY MISMATCH for {}:{} ({})", host, port, fingerprint);
                        Err(XferError::Connection(format!(
                            "Host key for {}:{} has changed",
                            host, port
                        )))
                    }
                    CheckResult::Failure => Err(XferError::Connection(
                        "Failed to check known hosts".to_string(),
                    )),
                }
            }
        }
    }
}

fn check_pinned(fingerprints: &[String], fingerprint: &str, host: &str, port: u16) -> XferResult<()> {
    let wanted = fingerprint.trim_end_matches('=');
    if fingerprints
        .iter()
        .any(|f| f.trim().trim_end_matches('=') == wanted)
    {
        Ok(())
    } else {
        tracing::error!("Unpinned host key for {}:{}: {}", host, port, fingerprint);
        Err(XferError::Connection(format!(
            "Host key {} for {}:{} is not pinned",
            fingerprint, host, port
        )))
    }
}

/// `host` on port 22, `[host]:port` otherwise
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn pinned_fingerprints_tolerate_padding() {
        let fp = compute_sha256_fingerprint(b"server key");
        let pins = vec![format!("{}=", fp)];
        assert!(check_pinned(&pins, &fp, "h", 22).is_ok());
        assert!(check_pinned(&["SHA256:other".to_string()], &fp, "h", 22).is_err());
    }

    #[test]
    fn policy_deserializes_from_settings() {
        let policy: HostKeyPolicy =
            toml::from_str("mode = \"pinned\"\nfingerprints = [\"SHA256:abc\"]").unwrap();
        assert_eq!(
            policy,
            HostKeyPolicy::Pinned {
                fingerprints: vec!["SHA256:abc".into()]
            }
        );
        assert_eq!(known_hosts_name("h", 22), "h");
        assert_eq!(known_hosts_name("h", 2222), "[h]:2222");
    }
}
