use crate::error::{XferError, XferResult};
use crate::ssh::HostDirectory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const HOSTS_FILE: &str = "hosts.toml";

/// Remote access protocol of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ssh,
    WinRm,
    Telnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
    Other,
}

/// Intermediate hop used to reach a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BastionConfig {
    /// Another inventory host acts as the bastion
    HostRef { host_id: String },
    Inline {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        credential_id: String,
    },
}

/// A remote machine the core can open sessions to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTarget {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub os: OsType,
    pub credential_id: String,
    #[serde(default)]
    pub bastion: Option<BastionConfig>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_port() -> u16 {
    22
}

impl HostTarget {
    pub fn new(name: String, host: String, credential_id: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            host,
            port: 22,
            protocol: Protocol::Ssh,
            os: OsType::Linux,
            credential_id,
            bastion: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bastion(mut self, bastion: BastionConfig) -> Self {
        self.bastion = Some(bastion);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    PrivateKey,
}

/// Credential description; the secret itself lives in a `SecretStore`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub id: String,
    pub name: String,
    pub username: String,
    pub kind: SecretKind,
    #[serde(default)]
    pub owner: Option<String>,
}

impl CredentialMetadata {
    pub fn new(name: String, username: String, kind: SecretKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            username,
            kind,
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<HostTarget>,
    #[serde(default)]
    pub credentials: Vec<CredentialMetadata>,
}

/// Host and credential inventory backed by `hosts.toml`
pub struct HostInventory {
    hosts: HashMap<String, HostTarget>,
    credentials: HashMap<String, CredentialMetadata>,
    config_path: Option<PathBuf>,
}

impl HostInventory {
    pub fn load(config_dir: &Path) -> XferResult<Self> {
        let config_path = config_dir.join(HOSTS_FILE);
        let file = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<HostsFile>(&content)?
        } else {
            HostsFile::default()
        };

        let mut inventory = Self::from_file(file);
        inventory.config_path = Some(config_path);
        Ok(inventory)
    }

    /// Inventory that is never written to disk
    pub fn in_memory() -> Self {
        Self::from_file(HostsFile::default())
    }

    fn from_file(file: HostsFile) -> Self {
        Self {
            hosts: file.hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
            credentials: file
                .credentials
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
            config_path: None,
        }
    }

    pub fn save(&self) -> XferResult<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };

        let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        let mut credentials: Vec<_> = self.credentials.values().cloned().collect();
        credentials.sort_by(|a, b| a.name.cmp(&b.name));

        let content = toml::to_string_pretty(&HostsFile { hosts, credentials })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<HostTarget> {
        let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    pub fn get(&self, id: &str) -> Option<HostTarget> {
        self.hosts.get(id).cloned()
    }

    /// Lookup by id first, then by display name
    pub fn find(&self, id_or_name: &str) -> Option<HostTarget> {
        self.get(id_or_name).or_else(|| {
            self.hosts
                .values()
                .find(|h| h.name == id_or_name)
                .cloned()
        })
    }

    pub fn add(&mut self, host: HostTarget) -> XferResult<()> {
        self.hosts.insert(host.id.clone(), host);
        self.save()
    }

    pub fn update(&mut self, host: HostTarget) -> XferResult<()> {
        if !self.hosts.contains_key(&host.id) {
            return Err(XferError::HostNotFound(host.id));
        }
        let mut host = host;
        host.updated_at = chrono::Utc::now().timestamp();
        self.hosts.insert(host.id.clone(), host);
        self.save()
    }

    pub fn delete(&mut self, id: &str) -> XferResult<()> {
        self.hosts
            .remove(id)
            .ok_or_else(|| XferError::HostNotFound(id.to_string()))?;
        self.save()
    }

    pub fn credential(&self, id: &str) -> Option<CredentialMetadata> {
        self.credentials.get(id).cloned()
    }

    pub fn add_credential(&mut self, credential: CredentialMetadata) -> XferResult<()> {
        self.credentials.insert(credential.id.clone(), credential);
        self.save()
    }

    pub fn delete_credential(&mut self, id: &str) -> XferResult<()> {
        if self.credentials.remove(id).is_none() {
            return Err(XferError::Config(format!("Unknown credential: {}", id)));
        }
        self.save()
    }
}

impl HostDirectory for HostInventory {
    fn host(&self, id: &str) -> Option<HostTarget> {
        self.get(id)
    }
}

impl HostDirectory for parking_lot::RwLock<HostInventory> {
    fn host(&self, id: &str) -> Option<HostTarget> {
        self.read().get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bastion_variants_parse_from_toml() {
        let file: HostsFile = toml::from_str(
            r#"
            [[hosts]]
            id = "jump"
            name = "jump"
            host = "bastion.example.com"
            credential_id = "credA"

            [[hosts]]
            id = "app"
            name = "app"
            host = "10.0.0.5"
            credential_id = "credB"
            bastion = { type = "host_ref", host_id = "jump" }

            [[hosts]]
            id = "db"
            name = "db"
            host = "10.0.0.6"
            port = 2222
            protocol = "ssh"
            credential_id = "credB"
            bastion = { type = "inline", host = "bastion.example.com", credential_id = "credA" }

            [[credentials]]
            id = "credA"
            name = "ops"
            username = "ops"
            kind = "private_key"
            "#,
        )
        .unwrap();

        let inventory = HostInventory::from_file(file);
        let app = inventory.get("app").unwrap();
        assert_eq!(
            app.bastion,
            Some(BastionConfig::HostRef {
                host_id: "jump".into()
            })
        );

        let db = inventory.find("db").unwrap();
        assert_eq!(db.port, 2222);
        assert_eq!(
            db.bastion,
            Some(BastionConfig::Inline {
                host: "bastion.example.com".into(),
                port: 22,
                credential_id: "credA".into(),
            })
        );
        assert_eq!(
            inventory.credential("credA").unwrap().kind,
            SecretKind::PrivateKey
        );
    }

    #[test]
    fn saved_inventory_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut inventory = HostInventory::load(dir.path()).unwrap();
        let host = HostTarget::new("web".into(), "web.internal".into(), "cred".into())
            .with_port(2200);
        let id = host.id.clone();
        inventory.add(host).unwrap();

        let reloaded = HostInventory::load(dir.path()).unwrap();
        assert_eq!(reloaded.host(&id).unwrap().port, 2200);
        assert!(matches!(
            inventory.delete("missing"),
            Err(XferError::HostNotFound(_))
        ));
    }
}
