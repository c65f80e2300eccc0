use super::{Bastion, Endpoint, Tunnel};
use crate::error::{XferError, XferResult};
use crate::sftp::RemoteFs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A session shared between callers; one operation holds the lock at a time
pub type SharedSession = Arc<Mutex<Session>>;

/// Session info for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub host_id: String,
    pub host: String,
    pub port: u16,
    pub via_bastion: bool,
    pub tunnel_port: Option<u16>,
    pub connected: bool,
    pub connected_at: Option<i64>,
}

/// Live connection to one host.
///
/// Owns the target file session and, when a bastion was used, the bastion
/// session and the local tunnel. Releasing tears down tunnel, bastion and
/// target in that order, skipping whatever was never created.
pub struct Session {
    id: String,
    host_id: String,
    endpoint: Endpoint,
    remote: Option<Box<dyn RemoteFs>>,
    bastion: Option<Box<dyn Bastion>>,
    tunnel: Option<Box<dyn Tunnel>>,
    connected_at: Option<i64>,
    released: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .field("endpoint", &self.endpoint)
            .field("remote", &self.remote.is_some())
            .field("bastion", &self.bastion.is_some())
            .field("tunnel_port", &self.tunnel_port())
            .field("released", &self.released)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(host_id: String, endpoint: Endpoint) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host_id,
            endpoint,
            remote: None,
            bastion: None,
            tunnel: None,
            connected_at: None,
            released: false,
        }
    }

    /// Wrap an already open file session
    pub fn from_remote(host_id: String, endpoint: Endpoint, remote: Box<dyn RemoteFs>) -> Self {
        let mut session = Self::new(host_id, endpoint);
        session.attach_remote(remote);
        session
    }

    pub(crate) fn attach_bastion(&mut self, bastion: Box<dyn Bastion>) -> &mut Box<dyn Bastion> {
        self.bastion.insert(bastion)
    }

    pub(crate) fn attach_tunnel(&mut self, tunnel: Box<dyn Tunnel>) -> &mut Box<dyn Tunnel> {
        self.tunnel.insert(tunnel)
    }

    pub(crate) fn attach_remote(&mut self, remote: Box<dyn RemoteFs>) {
        self.remote = Some(remote);
        self.connected_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The logical target, not the tunnel's loopback address
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        !self.released
            && self
                .remote
                .as_ref()
                .map(|r| r.is_connected())
                .unwrap_or(false)
    }

    pub fn remote(&self) -> XferResult<&dyn RemoteFs> {
        match &self.remote {
            Some(remote) if !self.released => Ok(remote.as_ref()),
            _ => Err(XferError::Connection(format!(
                "Session {} to {} is not connected",
                self.id, self.endpoint
            ))),
        }
    }

    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(|t| t.local_port())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            via_bastion: self.bastion.is_some(),
            tunnel_port: self.tunnel_port(),
            connected: self.is_connected(),
            connected_at: self.connected_at,
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Tear down tunnel, bastion, then target. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.stop();
        }
        if let Some(mut bastion) = self.bastion.take() {
            bastion.disconnect();
        }
        if let Some(mut remote) = self.remote.take() {
            remote.disconnect();
        }

        tracing::info!("Session {} to {} released", self.id, self.endpoint);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRemote;

    #[test]
    fn release_is_idempotent_and_disconnects() {
        let remote = Arc::new(MockRemote::new());
        let mut session = Session::from_remote(
            "h".into(),
            Endpoint::new("example.org", 22),
            Box::new(remote.clone()),
        );
        assert!(session.is_connected());
        assert!(session.info().connected_at.is_some());

        session.release();
        session.release();
        assert!(!session.is_connected());
        assert!(session.remote().is_err());
        assert_eq!(remote.disconnect_count(), 1);
    }

    #[test]
    fn drop_releases() {
        let remote = Arc::new(MockRemote::new());
        {
            let _session = Session::from_remote(
                "h".into(),
                Endpoint::new("example.org", 22),
                Box::new(remote.clone()),
            );
        }
        assert_eq!(remote.disconnect_count(), 1);
    }

    #[test]
    fn partial_session_releases_cleanly() {
        let mut session = Session::new("h".into(), Endpoint::new("example.org", 22));
        assert!(!session.is_connected());
        session.release();
        assert_eq!(session.info().tunnel_port, None);
    }

    #[test]
    fn debug_shows_parts_without_secrets() {
        let remote = Arc::new(MockRemote::new());
        let session = Session::from_remote(
            "h".into(),
            Endpoint::new("example.org", 22),
            Box::new(remote),
        );
        let text = format!("{:?}", session);
        assert!(text.contains("example.org"));
        assert!(text.contains("remote: true"));
        assert!(text.contains("bastion: false"));
    }
}
