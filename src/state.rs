use crate::config::{HostInventory, Settings};
use crate::error::{XferError, XferResult};
use crate::keychain::{KeyringStore, SecretStore, VaultCredentials, SERVICE_NAME};
use crate::listing::FileBrowser;
use crate::ssh::{ConnectionManager, Connector, Session, Ssh2Connector};
use crate::transfer::{TransferEngine, TransferQueue};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything needed to browse and transfer, built once per process
pub struct TransferCore {
    pub config_dir: Option<PathBuf>,
    pub settings: Arc<RwLock<Settings>>,
    pub inventory: Arc<RwLock<HostInventory>>,
    pub vault: Arc<VaultCredentials>,
    pub connections: Arc<ConnectionManager>,
    pub browser: Arc<FileBrowser>,
    pub engine: TransferEngine,
}

impl TransferCore {
    /// Load settings and hosts from `config_dir`, with secrets in the OS
    /// keychain (or the encrypted fallback file next to the config)
    pub fn load(config_dir: &Path) -> XferResult<Self> {
        std::fs::create_dir_all(config_dir)?;

        let settings = Settings::load(config_dir)?;
        let inventory = HostInventory::load(config_dir)?;
        let store = KeyringStore::new(SERVICE_NAME).with_fallback(config_dir);
        let connector = Arc::new(Ssh2Connector::new(settings.ssh.clone()));

        let mut core = Self::with_components(settings, inventory, Arc::new(store), connector);
        core.config_dir = Some(config_dir.to_path_buf());
        tracing::info!("Loaded configuration from {}", config_dir.display());
        Ok(core)
    }

    /// Assemble from explicit parts
    pub fn with_components(
        settings: Settings,
        inventory: HostInventory,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let inventory = Arc::new(RwLock::new(inventory));
        let vault = Arc::new(VaultCredentials::new(inventory.clone(), secrets));
        let connections = ConnectionManager::new(connector, vault.clone(), inventory.clone());
        let browser = FileBrowser::new(settings.cache.capacity);
        let engine = TransferEngine::new(settings.transfer.clone());

        Self {
            config_dir: None,
            settings: Arc::new(RwLock::new(settings)),
            inventory,
            vault,
            connections: Arc::new(connections),
            browser: Arc::new(browser),
            engine,
        }
    }

    /// Connect to a host by id or name
    pub fn connect(&self, host: &str) -> XferResult<Session> {
        let target = self
            .inventory
            .read()
            .find(host)
            .ok_or_else(|| XferError::HostNotFound(host.to_string()))?;
        self.connections.connect(&target)
    }

    /// Start a background queue; needs a tokio runtime
    pub fn start_queue(&self) -> TransferQueue {
        TransferQueue::start(self.engine.clone())
    }

    /// Persist settings when loaded from disk
    pub fn save_settings(&self) -> XferResult<()> {
        match &self.config_dir {
            Some(dir) => self.settings.read().save(dir),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialMetadata, HostTarget, SecretKind};
    use crate::keychain::MemoryStore;
    use crate::listing::SortColumn;
    use crate::testutil::MockConnector;

    fn core() -> TransferCore {
        let mut inventory = HostInventory::in_memory();
        let mut cred = CredentialMetadata::new("deploy".into(), "deploy".into(), SecretKind::Password);
        cred.id = "cred-1".into();
        inventory.add_credential(cred).unwrap();
        inventory
            .add(HostTarget::new("web".into(), "web.internal".into(), "cred-1".into()))
            .unwrap();

        let core = TransferCore::with_components(
            Settings::default(),
            inventory,
            Arc::new(MemoryStore::new()),
            Arc::new(MockConnector::new()),
        );
        core.vault.store_secret("cred-1", "pw").unwrap();
        core
    }

    #[test]
    fn connects_by_name_and_lists() {
        let core = core();
        let session = core.connect("web").unwrap();
        assert!(session.is_connected());
        assert_eq!(session.endpoint().to_string(), "web.internal:22");

        let entries = core
            .browser
            .list_remote(&session, "/", SortColumn::Name, true, false)
            .unwrap();
        assert!(entries.is_empty());
        assert_eq!(core.browser.cache().len(), 1);
    }

    #[test]
    fn unknown_host_is_reported() {
        let core = core();
        assert!(matches!(core.connect("db"), Err(XferError::HostNotFound(_))));
    }

    #[test]
    fn load_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let core = TransferCore::load(dir.path()).unwrap();
        assert_eq!(core.settings.read().transfer.max_concurrent, 3);
        assert!(dir.path().join("config.toml").exists());
        core.save_settings().unwrap();
    }
}
