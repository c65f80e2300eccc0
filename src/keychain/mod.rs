use crate::config::HostInventory;
use crate::error::{XferError, XferResult};
use crate::ssh::{CredentialResolver, ResolvedCredential};
use dashmap::DashMap;
use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SERVICE_NAME: &str = "remote-xfer";

const SECRETS_FILE: &str = ".secrets.enc";
const KEY_FILE: &str = ".keyfile";

/// Secret lookup by key
pub trait SecretStore: Send + Sync {
    fn store(&self, key: &str, secret: &str) -> XferResult<()>;
    fn get(&self, key: &str) -> XferResult<Option<String>>;
    fn delete(&self, key: &str) -> XferResult<()>;

    fn has(&self, key: &str) -> XferResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Keychain key under which a credential's secret is stored
pub fn credential_secret_key(credential_id: &str) -> XferResult<String> {
    validate_key_part(credential_id)?;
    Ok(format!("credential:{}", credential_id))
}

fn validate_key_part(part: &str) -> XferResult<()> {
    if part.is_empty() || part.len() > 256 {
        return Err(XferError::Keychain("Invalid secret key length".to_string()));
    }
    if part
        .chars()
        .any(|c| c.is_control() || c == ':' || c.is_whitespace())
    {
        return Err(XferError::Keychain(format!(
            "Invalid character in secret key: {}",
            part
        )));
    }
    Ok(())
}

/// In-process store, discarded with its owner
#[derive(Default)]
pub struct MemoryStore {
    secrets: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn store(&self, key: &str, secret: &str) -> XferResult<()> {
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> XferResult<Option<String>> {
        Ok(self.secrets.get(key).map(|s| s.value().clone()))
    }

    fn delete(&self, key: &str) -> XferResult<()> {
        self.secrets.remove(key);
        Ok(())
    }
}

/// AES-256-GCM encrypted secrets file
/// WARNING: the key sits next to the data, this is weaker than an OS keychain
pub struct EncryptedFileStore {
    dir: PathBuf,
}

impl EncryptedFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn secrets_path(&self) -> PathBuf {
        self.dir.join(SECRETS_FILE)
    }

    fn get_or_create_key(&self) -> XferResult<[u8; 32]> {
        use rand::RngCore;

        let key_path = self.dir.join(KEY_FILE);
        if key_path.exists() {
            let key_data = fs::read(&key_path)
                .map_err(|e| XferError::Keychain(format!("Failed to read key file: {}", e)))?;
            if key_data.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&key_data);
                return Ok(key);
            }
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        fs::create_dir_all(&self.dir)?;
        fs::write(&key_path, key)
            .map_err(|e| XferError::Keychain(format!("Failed to write key file: {}", e)))?;
        restrict_permissions(&key_path);

        Ok(key)
    }

    fn load(&self) -> XferResult<HashMap<String, String>> {
        use aes_gcm::{
            aead::{Aead, KeyInit},
            Aes256Gcm, Nonce,
        };

        let path = self.secrets_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let encrypted = fs::read(&path)
            .map_err(|e| XferError::Keychain(format!("Failed to read secrets file: {}", e)))?;
        if encrypted.len() < 12 {
            return Ok(HashMap::new());
        }

        let key = self.get_or_create_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| XferError::Keychain(format!("Failed to create cipher: {}", e)))?;

        let nonce = Nonce::from_slice(&encrypted[..12]);
        let plaintext = cipher
            .decrypt(nonce, &encrypted[12..])
            .map_err(|e| XferError::Keychain(format!("Failed to decrypt secrets: {}", e)))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn save(&self, secrets: &HashMap<String, String>) -> XferResult<()> {
        use aes_gcm::{
            aead::{Aead, KeyInit},
            Aes256Gcm, Nonce,
        };
        use rand::RngCore;

        let key = self.get_or_create_key()?;
        let json = serde_json::to_vec(secrets)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| XferError::Keychain(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, json.as_slice())
            .map_err(|e| XferError::Keychain(format!("Failed to encrypt secrets: {}", e)))?;

        // nonce || ciphertext
        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);

        let path = self.secrets_path();
        fs::write(&path, &output)
            .map_err(|e| XferError::Keychain(format!("Failed to write secrets file: {}", e)))?;
        restrict_permissions(&path);

        Ok(())
    }
}

impl SecretStore for EncryptedFileStore {
    fn store(&self, key: &str, secret: &str) -> XferResult<()> {
        let mut secrets = self.load()?;
        secrets.insert(key.to_string(), secret.to_string());
        self.save(&secrets)?;
        tracing::warn!("Stored secret in fallback file storage: {}", key);
        Ok(())
    }

    fn get(&self, key: &str) -> XferResult<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> XferResult<()> {
        let mut secrets = self.load()?;
        if secrets.remove(key).is_some() {
            self.save(&secrets)?;
        }
        Ok(())
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// OS keychain, with an optional encrypted-file fallback
pub struct KeyringStore {
    service: String,
    fallback: Option<EncryptedFileStore>,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback = Some(EncryptedFileStore::new(dir));
        self
    }

    /// True when the OS keychain rejects a probe write
    pub fn is_using_fallback(&self) -> bool {
        match Entry::new(&self.service, "__remote_xfer_keyring_test__") {
            Ok(entry) => {
                if entry.set_password("test").is_ok() {
                    let _ = entry.delete_password();
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        }
    }

    fn fallback(&self, cause: XferError) -> XferResult<&EncryptedFileStore> {
        self.fallback.as_ref().ok_or(cause)
    }
}

impl SecretStore for KeyringStore {
    fn store(&self, key: &str, secret: &str) -> XferResult<()> {
        let failure = match Entry::new(&self.service, key) {
            Ok(entry) => match entry.set_password(secret) {
                Ok(()) => {
                    tracing::debug!("Stored secret in OS keychain: {}", key);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("OS keychain failed, using fallback: {}", e);
                    XferError::from(e)
                }
            },
            Err(e) => {
                tracing::warn!("OS keychain unavailable, using fallback: {}", e);
                XferError::from(e)
            }
        };

        self.fallback(failure)?.store(key, secret)
    }

    fn get(&self, key: &str) -> XferResult<Option<String>> {
        let failure = match Entry::new(&self.service, key) {
            Ok(entry) => match entry.get_password() {
                Ok(secret) => return Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => None,
                Err(e) => {
                    tracing::debug!("OS keychain get failed, trying fallback: {}", e);
                    Some(XferError::from(e))
                }
            },
            Err(e) => {
                tracing::debug!("OS keychain unavailable for get, trying fallback: {}", e);
                Some(XferError::from(e))
            }
        };

        match (&self.fallback, failure) {
            (Some(fallback), _) => fallback.get(key),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> XferResult<()> {
        if let Ok(entry) = Entry::new(&self.service, key) {
            match entry.delete_password() {
                Ok(()) => tracing::debug!("Deleted secret from OS keychain: {}", key),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!("OS keychain delete failed: {}", e),
            }
        }

        if let Some(fallback) = &self.fallback {
            fallback.delete(key)?;
        }
        Ok(())
    }
}

/// Resolves credentials from inventory metadata plus a secret store
pub struct VaultCredentials {
    inventory: Arc<RwLock<HostInventory>>,
    store: Arc<dyn SecretStore>,
}

impl VaultCredentials {
    pub fn new(inventory: Arc<RwLock<HostInventory>>, store: Arc<dyn SecretStore>) -> Self {
        Self { inventory, store }
    }

    pub fn store_secret(&self, credential_id: &str, secret: &str) -> XferResult<()> {
        self.store
            .store(&credential_secret_key(credential_id)?, secret)
    }
}

impl CredentialResolver for VaultCredentials {
    fn resolve(&self, credential_id: &str) -> XferResult<ResolvedCredential> {
        let key = credential_secret_key(credential_id).map_err(|e| {
            XferError::Connection(format!("Credential {} unresolvable: {}", credential_id, e))
        })?;
        let metadata = self.inventory.read().credential(credential_id).ok_or_else(|| {
            XferError::Connection(format!("Unknown credential: {}", credential_id))
        })?;
        if metadata.username.trim().is_empty() {
            return Err(XferError::Connection(format!(
                "Credential {} has no username",
                credential_id
            )));
        }

        let secret = self
            .store
            .get(&key)
            .map_err(|e| {
                XferError::Connection(format!("Credential {} unavailable: {}", credential_id, e))
            })?
            .ok_or_else(|| {
                XferError::Connection(format!("No secret stored for credential {}", credential_id))
            })?;

        Ok(ResolvedCredential {
            username: metadata.username,
            secret,
            kind: metadata.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialMetadata, SecretKind};

    #[test]
    fn credential_keys_are_namespaced_and_validated() {
        assert_eq!(credential_secret_key("abc").unwrap(), "credential:abc");
        assert!(credential_secret_key("").is_err());
        assert!(credential_secret_key("a:b").is_err());
        assert!(credential_secret_key("a b").is_err());
    }

    #[test]
    fn encrypted_file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        EncryptedFileStore::new(dir.path())
            .store("credential:x", "s3cret")
            .unwrap();

        let reopened = EncryptedFileStore::new(dir.path());
        assert_eq!(reopened.get("credential:x").unwrap().as_deref(), Some("s3cret"));
        assert!(!fs::read(dir.path().join(SECRETS_FILE))
            .unwrap()
            .windows(6)
            .any(|w| w == b"s3cret"));

        reopened.delete("credential:x").unwrap();
        assert!(!reopened.has("credential:x").unwrap());
    }

    #[test]
    fn vault_resolves_metadata_and_secret() {
        let mut inventory = HostInventory::in_memory();
        let cred = CredentialMetadata::new("ops".into(), "deploy".into(), SecretKind::Password);
        let cred_id = cred.id.clone();
        inventory.add_credential(cred).unwrap();

        let vault = VaultCredentials::new(
            Arc::new(RwLock::new(inventory)),
            Arc::new(MemoryStore::new()),
        );

        assert!(matches!(
            vault.resolve(&cred_id),
            Err(XferError::Connection(_))
        ));

        vault.store_secret(&cred_id, "hunter2").unwrap();
        let resolved = vault.resolve(&cred_id).unwrap();
        assert_eq!(resolved.username, "deploy");
        assert_eq!(resolved.secret, "hunter2");
        assert_eq!(resolved.kind, SecretKind::Password);
        assert!(!format!("{:?}", resolved).contains("hunter2"));

        assert!(matches!(
            vault.resolve("missing"),
            Err(XferError::Connection(_))
        ));
    }

    #[test]
    fn unusable_credentials_are_connection_errors() {
        let mut inventory = HostInventory::in_memory();
        let mut odd = CredentialMetadata::new("odd".into(), "deploy".into(), SecretKind::Password);
        odd.id = "team:ops".into();
        inventory.add_credential(odd).unwrap();
        let mut anonymous = CredentialMetadata::new("anon".into(), "  ".into(), SecretKind::Password);
        anonymous.id = "anon".into();
        inventory.add_credential(anonymous).unwrap();

        let vault = VaultCredentials::new(
            Arc::new(RwLock::new(inventory)),
            Arc::new(MemoryStore::new()),
        );
        vault.store_secret("anon", "pw").unwrap();

        assert!(matches!(vault.resolve("team:ops"), Err(XferError::Connection(_))));
        assert!(matches!(vault.resolve("with space"), Err(XferError::Connection(_))));
        match vault.resolve("anon") {
            Err(XferError::Connection(message)) => assert!(message.contains("no username")),
            other => panic!("expected a connection error, got {:?}", other),
        }
    }
}
