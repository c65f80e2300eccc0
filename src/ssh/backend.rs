//! libssh2-backed sessions, bastions and local port forwards

use super::{auth, Bastion, Connector, Endpoint, ResolvedCredential, Tunnel};
use crate::config::SshSettings;
use crate::error::{XferError, XferResult};
use crate::sftp::{RemoteFs, SftpConnection};
use parking_lot::Mutex;
use ssh2::{ErrorCode, Session as Ssh2Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// libssh2 "would block"
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const RELAY_BUFFER_BYTES: usize = 32 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(2);
const ACCEPT_SLEEP: Duration = Duration::from_millis(20);

/// Opens real SSH sessions
pub struct Ssh2Connector {
    settings: SshSettings,
}

impl Ssh2Connector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn open_session(
        &self,
        dial: &Endpoint,
        identity: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Ssh2Session> {
        tracing::info!(
            "Connecting to {}@{} (dial {})",
            credential.username,
            identity,
            dial
        );

        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let addr = (dial.host.as_str(), dial.port)
            .to_socket_addrs()
            .map_err(|e| XferError::Connection(format!("Cannot resolve {}: {}", dial, e)))?
            .next()
            .ok_or_else(|| XferError::Connection(format!("No address for {}", dial)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| XferError::Connection(format!("TCP connect to {} failed: {}", dial, e)))?;
        tcp.set_nodelay(true)?;

        let mut session = Ssh2Session::new()
            .map_err(|e| XferError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_keepalive(true, self.settings.keepalive_interval);

        session
            .handshake()
            .map_err(|e| XferError::Connection(format!("SSH handshake with {} failed: {}", identity, e)))?;

        self.settings
            .host_key_policy
            .verify(&session, &identity.host, identity.port)?;

        auth::authenticate(&session, credential)?;
        Ok(session)
    }
}

impl Connector for Ssh2Connector {
    fn open_remote(
        &self,
        dial: &Endpoint,
        identity: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn RemoteFs>> {
        let session = self.open_session(dial, identity, credential)?;
        let connection = SftpConnection::open(session, identity.to_string())?;
        Ok(Box::new(connection))
    }

    fn open_bastion(
        &self,
        endpoint: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn Bastion>> {
        let session = self.open_session(endpoint, endpoint, credential)?;
        Ok(Box::new(Ssh2Bastion {
            session,
            label: endpoint.to_string(),
            keepalive: Duration::from_secs(self.settings.keepalive_interval.max(1) as u64),
            connected: true,
        }))
    }
}

/// Authenticated session to a jump host
pub struct Ssh2Bastion {
    session: Ssh2Session,
    label: String,
    keepalive: Duration,
    connected: bool,
}

impl Bastion for Ssh2Bastion {
    fn forward_local(&mut self, local_port: u16, target: &Endpoint) -> XferResult<Box<dyn Tunnel>> {
        if !self.connected {
            return Err(XferError::Connection(format!(
                "Bastion {} is disconnected",
                self.label
            )));
        }
        Ok(Box::new(Ssh2Tunnel::new(
            self.session.clone(),
            local_port,
            target.clone(),
            self.keepalive,
        )))
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.session.set_blocking(true);
        if let Err(e) = self.session.disconnect(None, "closing bastion", None) {
            tracing::debug!("Bastion {} disconnect failed: {}", self.label, e);
        }
        tracing::debug!("Bastion {} disconnected", self.label);
    }
}

impl Drop for Ssh2Bastion {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Listens on loopback and relays each accepted connection through a
/// `direct-tcpip` channel on the bastion session
pub struct Ssh2Tunnel {
    session: Ssh2Session,
    local_port: u16,
    target: Endpoint,
    keepalive: Duration,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    relays: Arc<Mutex<Vec<JoinHandle<()>>>>,
    started: bool,
}

impl Ssh2Tunnel {
    fn new(session: Ssh2Session, local_port: u16, target: Endpoint, keepalive: Duration) -> Self {
        Self {
            session,
            local_port,
            target,
            keepalive,
            stop: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            relays: Arc::new(Mutex::new(Vec::new())),
            started: false,
        }
    }
}

impl Tunnel for Ssh2Tunnel {
    fn start(&mut self) -> XferResult<()> {
        if self.started {
            return Ok(());
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.local_port)).map_err(|e| {
            XferError::Connection(format!("Failed to bind local port {}: {}", self.local_port, e))
        })?;
        listener.set_nonblocking(true)?;

        // Channels from several relay threads share the session
        self.session.set_blocking(false);

        let session = self.session.clone();
        let target = self.target.clone();
        let stop = self.stop.clone();
        let relays = self.relays.clone();
        let keepalive = self.keepalive;

        let handle = thread::Builder::new()
            .name(format!("tunnel-{}", self.local_port))
            .spawn(move || accept_loop(listener, session, target, stop, relays, keepalive))?;

        self.accept_thread = Some(handle);
        self.started = true;
        tracing::info!(
            "Local port forward started on 127.0.0.1:{} -> {}",
            self.local_port,
            self.target
        );
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started && !self.stop.load(Ordering::SeqCst)
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let relays: Vec<_> = self.relays.lock().drain(..).collect();
        for relay in relays {
            let _ = relay.join();
        }

        if self.started {
            self.started = false;
            tracing::debug!("Local port forward on 127.0.0.1:{} stopped", self.local_port);
        }
    }
}

impl Drop for Ssh2Tunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    session: Ssh2Session,
    target: Endpoint,
    stop: Arc<AtomicBool>,
    relays: Arc<Mutex<Vec<JoinHandle<()>>>>,
    keepalive: Duration,
) {
    let mut last_keepalive = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if last_keepalive.elapsed() >= keepalive {
            if let Err(e) = session.keepalive_send() {
                if !is_eagain(&e) {
                    tracing::warn!("Bastion keepalive failed: {}", e);
                }
            }
            last_keepalive = Instant::now();
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted tunnel connection from {}", peer);
                let session = session.clone();
                let target = target.clone();
                let stop = stop.clone();
                let handle = thread::spawn(move || {
                    if let Err(e) = relay(session, stream, &target, &stop) {
                        tracing::debug!("Tunnel relay to {} ended: {}", target, e);
                    }
                });
                relays.lock().push(handle);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_SLEEP),
            Err(e) => {
                tracing::error!("Failed to accept tunnel connection: {}", e);
                thread::sleep(ACCEPT_SLEEP);
            }
        }
    }
}

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn relay(session: Ssh2Session, mut local: TcpStream, target: &Endpoint, stop: &AtomicBool) -> XferResult<()> {
    let mut channel = loop {
        match session.channel_direct_tcpip(&target.host, target.port, None) {
            Ok(channel) => break channel,
            Err(ref e) if is_eagain(e) => {
                if stop.load(Ordering::SeqCst) {
                    return Err(XferError::Cancelled);
                }
                thread::sleep(IDLE_SLEEP);
            }
            Err(e) => {
                return Err(XferError::Connection(format!(
                    "Failed to open channel to {}: {}",
                    target, e
                )))
            }
        }
    };

    local.set_nonblocking(true)?;
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];

    while !stop.load(Ordering::SeqCst) {
        let mut idle = true;

        match local.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                write_fully(&mut channel, &buf[..n], stop)?;
                idle = false;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                write_fully(&mut local, &buf[..n], stop)?;
                idle = false;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }

        if idle {
            thread::sleep(IDLE_SLEEP);
        }
    }

    let _ = channel.send_eof();
    let _ = channel.close();
    Ok(())
}

/// `write_all` for non-blocking writers
fn write_fully<W: Write>(writer: &mut W, mut data: &[u8], stop: &AtomicBool) -> XferResult<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => thread::sleep(IDLE_SLEEP),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                if stop.load(Ordering::SeqCst) {
                    return Err(XferError::Cancelled);
                }
                thread::sleep(IDLE_SLEEP);
            }
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(IDLE_SLEEP),
            Err(e) => return Err(e.into()),
        }
    }
}
