pub mod auth;
pub mod backend;
pub mod hostkey;
pub mod session;

pub use backend::Ssh2Connector;
pub use hostkey::HostKeyPolicy;
pub use session::*;

use crate::config::{BastionConfig, HostTarget, Protocol, SecretKind};
use crate::error::{XferError, XferResult};
use crate::sftp::RemoteFs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

/// A host and port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST.to_string(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A credential with its secret loaded
#[derive(Clone)]
pub struct ResolvedCredential {
    pub username: String,
    pub secret: String,
    pub kind: SecretKind,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Credential id to username, secret and secret kind
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, credential_id: &str) -> XferResult<ResolvedCredential>;
}

/// Host id to host target, used to follow bastion references
pub trait HostDirectory: Send + Sync {
    fn host(&self, id: &str) -> Option<HostTarget>;
}

/// Hands out a free local TCP port
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> XferResult<u16>;
}

/// Binds loopback port 0 and releases the socket right away
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPortAllocator;

impl PortAllocator for LoopbackPortAllocator {
    fn allocate(&self) -> XferResult<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| XferError::Connection(format!("No free local port: {}", e)))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }
}

/// Opens protocol sessions
pub trait Connector: Send + Sync {
    /// Authenticated file session. `dial` is where the TCP connection goes,
    /// `identity` the host the session is for (they differ behind a tunnel).
    fn open_remote(
        &self,
        dial: &Endpoint,
        identity: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn RemoteFs>>;

    fn open_bastion(
        &self,
        endpoint: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn Bastion>>;
}

/// Authenticated session to an intermediate host
pub trait Bastion: Send {
    /// Prepare a forward of loopback:`local_port` to `target`; not yet listening
    fn forward_local(&mut self, local_port: u16, target: &Endpoint) -> XferResult<Box<dyn Tunnel>>;
    fn disconnect(&mut self);
}

/// Local port forward carried by a bastion session
pub trait Tunnel: Send {
    fn start(&mut self) -> XferResult<()>;
    fn is_started(&self) -> bool;
    fn local_port(&self) -> u16;
    fn stop(&mut self);
}

/// Builds sessions from host targets
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialResolver>,
    hosts: Arc<dyn HostDirectory>,
    ports: Arc<dyn PortAllocator>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialResolver>,
        hosts: Arc<dyn HostDirectory>,
    ) -> Self {
        Self {
            connector,
            credentials,
            hosts,
            ports: Arc::new(LoopbackPortAllocator),
        }
    }

    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    /// Open a session to `target`, through its bastion when it has one.
    ///
    /// On failure every resource created so far is released before the
    /// error is returned.
    pub fn connect(&self, target: &HostTarget) -> XferResult<Session> {
        if target.protocol != Protocol::Ssh {
            return Err(XferError::Connection(format!(
                "Protocol {:?} is not supported for file access on {}",
                target.protocol, target.name
            )));
        }

        let endpoint = Endpoint::new(&target.host, target.port);
        let mut session = Session::new(target.id.clone(), endpoint);

        match self.establish(target, &mut session) {
            Ok(()) => {
                tracing::info!("Session {} connected to {}", session.id(), session.endpoint());
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(
                    "Connection to {} failed: {}",
                    session.endpoint(),
                    crate::logging::sanitize(&e.to_string())
                );
                session.release();
                Err(e)
            }
        }
    }

    fn establish(&self, target: &HostTarget, session: &mut Session) -> XferResult<()> {
        let credential = self.credentials.resolve(&target.credential_id)?;
        let endpoint = session.endpoint().clone();

        let dial = match &target.bastion {
            Some(config) => {
                let (bastion_endpoint, bastion_credential_id) = self.resolve_bastion(config)?;
                let bastion_credential = self.credentials.resolve(&bastion_credential_id)?;

                tracing::info!("Opening bastion {} for {}", bastion_endpoint, endpoint);
                let bastion = session.attach_bastion(
                    self.connector
                        .open_bastion(&bastion_endpoint, &bastion_credential)?,
                );

                let local_port = self.ports.allocate()?;
                let tunnel = bastion.forward_local(local_port, &endpoint)?;
                let tunnel = session.attach_tunnel(tunnel);
                tunnel.start()?;
                if !tunnel.is_started() {
                    return Err(XferError::Connection(format!(
                        "Tunnel 127.0.0.1:{} -> {} did not start",
                        local_port, endpoint
                    )));
                }
                tracing::debug!("Tunnel 127.0.0.1:{} -> {} started", local_port, endpoint);

                Endpoint::loopback(tunnel.local_port())
            }
            None => endpoint.clone(),
        };

        let remote = self.connector.open_remote(&dial, &endpoint, &credential)?;
        session.attach_remote(remote);
        Ok(())
    }

    /// Bastion endpoint and credential id, following host references
    fn resolve_bastion(&self, config: &BastionConfig) -> XferResult<(Endpoint, String)> {
        match config {
            BastionConfig::HostRef { host_id } => {
                let host = self.hosts.host(host_id).ok_or_else(|| {
                    XferError::Connection(format!("Unknown bastion host: {}", host_id))
                })?;
                Ok((Endpoint::new(host.host, host.port), host.credential_id))
            }
            BastionConfig::Inline {
                host,
                port,
                credential_id,
            } => Ok((Endpoint::new(host.clone(), *port), credential_id.clone())),
        }
    }

    /// Release everything the session holds; safe to call repeatedly
    pub fn disconnect(&self, session: &mut Session) {
        session.release();
    }
}
