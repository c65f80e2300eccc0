//! In-memory remote filesystem and connector used by unit tests

use crate::error::{XferError, XferResult};
use crate::listing::normalize_remote_path;
use crate::sftp::{
    join_remote, remote_file_name, remote_parent, CommandOutput, RemoteDirEntry, RemoteFs,
    RemoteStat, WriteMode,
};
use crate::ssh::{Bastion, Connector, Endpoint, PortAllocator, ResolvedCredential, Session, Tunnel};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection lifecycle steps seen by `MockConnector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BastionOpened { endpoint: String, username: String },
    TunnelStarted { local_port: u16, target: String },
    RemoteOpened { dial: String, identity: String, username: String },
    TunnelStopped,
    BastionDisconnected,
    RemoteDisconnected,
}

type EventLog = Arc<Mutex<Vec<Event>>>;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    modes: HashMap<String, u32>,
    denied_lists: HashSet<String>,
    denied_writes: HashSet<String>,
    list_calls: HashMap<String, usize>,
    write_offsets: HashMap<String, Vec<u64>>,
    read_offsets: HashMap<String, Vec<u64>>,
    commands: Vec<String>,
    command_results: HashMap<String, CommandOutput>,
    hash_overrides: HashMap<String, String>,
    disconnects: usize,
    connected: bool,
}

impl State {
    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn add_dirs(&mut self, path: &str) {
        let mut current = Some(path.to_string());
        while let Some(dir) = current {
            current = remote_parent(&dir).map(str::to_string);
            self.nodes.entry(dir).or_insert(Node::Dir);
        }
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        remote_parent(path).map_or(true, |p| self.is_dir(p))
    }
}

/// In-memory `RemoteFs` that records what was asked of it
pub struct MockRemote {
    state: Mutex<State>,
    events: Option<EventLog>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        let mut state = State {
            connected: true,
            ..State::default()
        };
        state.nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Mutex::new(state),
            events: None,
        }
    }

    fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Add a file, creating its parent directories
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        if let Some(parent) = remote_parent(&path) {
            state.add_dirs(parent);
        }
        state.nodes.insert(path, Node::File(data.to_vec()));
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().add_dirs(&normalize_remote_path(path));
    }

    /// Listing this directory fails with permission denied
    pub fn deny(&self, path: &str) {
        self.state.lock().denied_lists.insert(normalize_remote_path(path));
    }

    /// Opening this file for writing fails with permission denied
    pub fn deny_write(&self, path: &str) {
        self.state.lock().denied_writes.insert(normalize_remote_path(path));
    }

    /// Make `sha256sum` report `hash` for this path
    pub fn override_hash(&self, path: &str, hash: &str) {
        self.state
            .lock()
            .hash_overrides
            .insert(normalize_remote_path(path), hash.to_string());
    }

    pub fn set_command_result(&self, command: &str, output: CommandOutput) {
        self.state
            .lock()
            .command_results
            .insert(command.to_string(), output);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(&normalize_remote_path(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.state.lock().is_dir(&normalize_remote_path(path))
    }

    pub fn mode_of(&self, path: &str) -> Option<u32> {
        self.state.lock().modes.get(&normalize_remote_path(path)).copied()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn list_calls(&self, path: &str) -> usize {
        self.state
            .lock()
            .list_calls
            .get(&normalize_remote_path(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn write_offsets(&self, path: &str) -> Vec<u64> {
        self.state
            .lock()
            .write_offsets
            .get(&normalize_remote_path(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn read_offsets(&self, path: &str) -> Vec<u64> {
        self.state
            .lock()
            .read_offsets
            .get(&normalize_remote_path(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    fn mark_disconnected(&self) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.disconnects += 1;
        }
        if let Some(events) = &self.events {
            events.lock().push(Event::RemoteDisconnected);
        }
    }

    fn sha256sum(&self, state: &State, command: &str) -> CommandOutput {
        let quoted = command.trim_start_matches("sha256sum ").trim();
        let path = quoted
            .trim_start_matches('\'')
            .trim_end_matches('\'')
            .replace("'\\''", "'");
        let key = normalize_remote_path(&path);

        let hash = match (state.hash_overrides.get(&key), state.nodes.get(&key)) {
            (Some(hash), _) => hash.clone(),
            (None, Some(Node::File(data))) => hex::encode(Sha256::digest(data)),
            _ => {
                return CommandOutput {
                    stdout: String::new(),
                    stderr: format!("sha256sum: {}: No such file or directory", path),
                    exit_code: 1,
                }
            }
        };
        CommandOutput {
            stdout: format!("{}  {}\n", hash, path),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

struct MockWriter<'a> {
    remote: &'a MockRemote,
    path: String,
    pos: usize,
}

impl Write for MockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.remote.state.lock();
        let Some(Node::File(data)) = state.nodes.get_mut(&self.path) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} vanished", self.path),
            ));
        };
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl RemoteFs for MockRemote {
    fn read_dir(&self, path: &str) -> XferResult<Vec<RemoteDirEntry>> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        *state.list_calls.entry(path.clone()).or_insert(0) += 1;

        if state.denied_lists.contains(&path) {
            return Err(XferError::PermissionDenied(path));
        }
        if !state.is_dir(&path) {
            return Err(XferError::NotFound(path));
        }

        let dir_stat = RemoteStat {
            is_dir: true,
            ..RemoteStat::default()
        };
        let mut entries = vec![
            RemoteDirEntry {
                name: ".".into(),
                path: path.clone(),
                stat: dir_stat,
            },
            RemoteDirEntry {
                name: "..".into(),
                path: remote_parent(&path).unwrap_or("/").to_string(),
                stat: dir_stat,
            },
        ];
        for (child, node) in &state.nodes {
            if child == &path || remote_parent(child) != Some(path.as_str()) {
                continue;
            }
            let stat = match node {
                Node::Dir => dir_stat,
                Node::File(data) => RemoteStat {
                    size: data.len() as u64,
                    perm: state.modes.get(child).copied(),
                    ..RemoteStat::default()
                },
            };
            let name = remote_file_name(child).to_string();
            entries.push(RemoteDirEntry {
                path: join_remote(&path, &name),
                name,
                stat,
            });
        }
        Ok(entries)
    }

    fn stat(&self, path: &str) -> XferResult<RemoteStat> {
        let path = normalize_remote_path(path);
        let state = self.state.lock();
        let perm = state.modes.get(&path).copied();
        match state.nodes.get(&path) {
            Some(Node::Dir) => Ok(RemoteStat {
                is_dir: true,
                perm,
                ..RemoteStat::default()
            }),
            Some(Node::File(data)) => Ok(RemoteStat {
                size: data.len() as u64,
                perm,
                ..RemoteStat::default()
            }),
            None => Err(XferError::NotFound(path)),
        }
    }

    fn mkdir(&self, path: &str) -> XferResult<()> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        if state.nodes.contains_key(&path) {
            return Err(XferError::AlreadyExists(path));
        }
        if !state.parent_is_dir(&path) {
            return Err(XferError::NotFound(path));
        }
        state.nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn open_read(&self, path: &str, offset: u64) -> XferResult<Box<dyn Read + '_>> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        let data = match state.nodes.get(&path) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Dir) => return Err(XferError::Transfer(format!("{} is a directory", path))),
            None => return Err(XferError::NotFound(path)),
        };
        state.read_offsets.entry(path).or_default().push(offset);
        let start = (offset as usize).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }

    fn open_write(&self, path: &str, mode: WriteMode) -> XferResult<Box<dyn Write + '_>> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        if state.denied_writes.contains(&path) {
            return Err(XferError::PermissionDenied(path));
        }
        if !state.parent_is_dir(&path) || state.is_dir(&path) {
            return Err(XferError::NotFound(path));
        }

        let offset = match mode {
            WriteMode::Truncate => 0,
            WriteMode::Resume(offset) => offset,
        };
        let node = state
            .nodes
            .entry(path.clone())
            .or_insert_with(|| Node::File(Vec::new()));
        if let Node::File(data) = node {
            data.truncate(offset as usize);
        }
        state.write_offsets.entry(path.clone()).or_default().push(offset);

        Ok(Box::new(MockWriter {
            remote: self,
            path,
            pos: offset as usize,
        }))
    }

    fn rename(&self, from: &str, to: &str) -> XferResult<()> {
        let from = normalize_remote_path(from);
        let to = normalize_remote_path(to);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&from) {
            return Err(XferError::NotFound(from));
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> XferResult<()> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(Node::File(_)) => {
                state.nodes.remove(&path);
                Ok(())
            }
            _ => Err(XferError::NotFound(path)),
        }
    }

    fn remove_dir(&self, path: &str) -> XferResult<()> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        if !state.is_dir(&path) {
            return Err(XferError::NotFound(path));
        }
        let prefix = format!("{}/", path);
        if state.nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(XferError::Transfer(format!("{} is not empty", path)));
        }
        state.nodes.remove(&path);
        Ok(())
    }

    fn set_mode(&self, path: &str, mode: u32) -> XferResult<()> {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&path) {
            return Err(XferError::NotFound(path));
        }
        state.modes.insert(path, mode);
        Ok(())
    }

    fn exec(&self, command: &str) -> XferResult<CommandOutput> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());
        if let Some(output) = state.command_results.get(command) {
            return Ok(output.clone());
        }
        if command.starts_with("sha256sum ") {
            return Ok(self.sha256sum(&state, command));
        }
        Ok(CommandOutput::default())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn disconnect(&mut self) {
        self.mark_disconnected();
    }
}

impl RemoteFs for Arc<MockRemote> {
    fn read_dir(&self, path: &str) -> XferResult<Vec<RemoteDirEntry>> {
        (**self).read_dir(path)
    }

    fn stat(&self, path: &str) -> XferResult<RemoteStat> {
        (**self).stat(path)
    }

    fn mkdir(&self, path: &str) -> XferResult<()> {
        (**self).mkdir(path)
    }

    fn open_read(&self, path: &str, offset: u64) -> XferResult<Box<dyn Read + '_>> {
        (**self).open_read(path, offset)
    }

    fn open_write(&self, path: &str, mode: WriteMode) -> XferResult<Box<dyn Write + '_>> {
        (**self).open_write(path, mode)
    }

    fn rename(&self, from: &str, to: &str) -> XferResult<()> {
        (**self).rename(from, to)
    }

    fn remove_file(&self, path: &str) -> XferResult<()> {
        (**self).remove_file(path)
    }

    fn remove_dir(&self, path: &str) -> XferResult<()> {
        (**self).remove_dir(path)
    }

    fn set_mode(&self, path: &str, mode: u32) -> XferResult<()> {
        (**self).set_mode(path, mode)
    }

    fn exec(&self, command: &str) -> XferResult<CommandOutput> {
        (**self).exec(command)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn disconnect(&mut self) {
        self.mark_disconnected();
    }
}

/// A session over `remote`, keyed as `mock.example:22`
pub fn connected_session(remote: Arc<MockRemote>) -> Session {
    connected_session_at(remote, "mock.example")
}

pub fn connected_session_at(remote: Arc<MockRemote>, host: &str) -> Session {
    Session::from_remote(host.to_string(), Endpoint::new(host, 22), Box::new(remote))
}

/// Hands out consecutive ports and counts them
pub struct CountingPorts {
    next: AtomicU16,
    allocated: AtomicUsize,
}

impl CountingPorts {
    pub fn starting_at(port: u16) -> Self {
        Self {
            next: AtomicU16::new(port),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}

impl PortAllocator for CountingPorts {
    fn allocate(&self) -> XferResult<u16> {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Connector producing in-memory sessions and logging every step
#[derive(Default)]
pub struct MockConnector {
    events: EventLog,
    fail_remote: AtomicBool,
    refuse_start: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn teardown_events(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::TunnelStopped | Event::BastionDisconnected | Event::RemoteDisconnected
                )
            })
            .cloned()
            .collect()
    }

    /// Target sessions fail to open from now on
    pub fn fail_remote_open(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Tunnels accept `start` but never report started
    pub fn refuse_tunnel_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn open_remote(
        &self,
        dial: &Endpoint,
        identity: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn RemoteFs>> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(XferError::Connection(format!("{} refused the connection", dial)));
        }
        self.events.lock().push(Event::RemoteOpened {
            dial: dial.to_string(),
            identity: identity.to_string(),
            username: credential.username.clone(),
        });
        Ok(Box::new(Arc::new(
            MockRemote::new().with_events(self.events.clone()),
        )))
    }

    fn open_bastion(
        &self,
        endpoint: &Endpoint,
        credential: &ResolvedCredential,
    ) -> XferResult<Box<dyn Bastion>> {
        self.events.lock().push(Event::BastionOpened {
            endpoint: endpoint.to_string(),
            username: credential.username.clone(),
        });
        Ok(Box::new(MockBastion {
            events: self.events.clone(),
            refuse_start: self.refuse_start.clone(),
        }))
    }
}

struct MockBastion {
    events: EventLog,
    refuse_start: Arc<AtomicBool>,
}

impl Bastion for MockBastion {
    fn forward_local(&mut self, local_port: u16, target: &Endpoint) -> XferResult<Box<dyn Tunnel>> {
        Ok(Box::new(MockTunnel {
            events: self.events.clone(),
            local_port,
            target: target.to_string(),
            started: false,
            refuse_start: self.refuse_start.load(Ordering::SeqCst),
        }))
    }

    fn disconnect(&mut self) {
        self.events.lock().push(Event::BastionDisconnected);
    }
}

struct MockTunnel {
    events: EventLog,
    local_port: u16,
    target: String,
    started: bool,
    refuse_start: bool,
}

impl Tunnel for MockTunnel {
    fn start(&mut self) -> XferResult<()> {
        if !self.refuse_start {
            self.started = true;
            self.events.lock().push(Event::TunnelStarted {
                local_port: self.local_port,
                target: self.target.clone(),
            });
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn stop(&mut self) {
        self.started = false;
        self.events.lock().push(Event::TunnelStopped);
    }
}
