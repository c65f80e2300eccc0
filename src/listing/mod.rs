//! Directory listings, local and remote
//!
//! Remote listings are kept in a small insertion-ordered cache keyed by
//! endpoint and normalized path. Structural changes made through
//! `FileBrowser` drop the whole cache instead of patching entries.

use crate::error::XferResult;
use crate::sftp::{format_permissions, ops, RemoteDirEntry, RemoteFs, RemoteStat};
use crate::ssh::Session;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

pub const DEFAULT_CACHE_CAPACITY: usize = 5;

/// One file or directory, local or remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// Zero for directories
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// `rwxr-xr-x` style, remote entries only
    pub permissions: Option<String>,
    pub is_local: bool,
}

impl FileEntry {
    pub fn remote(name: String, path: String, stat: &RemoteStat) -> Self {
        Self {
            name,
            path,
            is_dir: stat.is_dir,
            size: if stat.is_dir { 0 } else { stat.size },
            modified: stat
                .modified
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            permissions: stat.perm.map(|p| format_permissions(p, stat.is_dir)),
            is_local: false,
        }
    }

    fn from_dir_entry(entry: RemoteDirEntry) -> Self {
        Self::remote(entry.name, entry.path, &entry.stat)
    }

    /// Human readable size, empty for directories
    pub fn size_display(&self) -> String {
        if self.is_dir {
            String::new()
        } else {
            crate::transfer::format_bytes(self.size)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortColumn {
    #[default]
    Name,
    Size,
    Modified,
}

impl std::str::FromStr for SortColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "name" => Ok(SortColumn::Name),
            "size" => Ok(SortColumn::Size),
            "date" | "modified" => Ok(SortColumn::Modified),
            other => Err(format!("unknown sort column: {}", other)),
        }
    }
}

/// Directories first, then by `column`; equal entries keep listing order
pub fn sort_entries(entries: &mut [FileEntry], column: SortColumn, ascending: bool) {
    entries.sort_by(|a, b| {
        b.is_dir.cmp(&a.is_dir).then_with(|| {
            let ord = match column {
                SortColumn::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortColumn::Size => a.size.cmp(&b.size),
                SortColumn::Modified => a.modified.cmp(&b.modified),
            };
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        })
    });
}

/// Normalize a remote path for use as a cache key
pub fn normalize_remote_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return ".".to_string();
    }

    let absolute = trimmed.starts_with('/');
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    match (absolute, segments.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", segments.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => segments.join("/"),
    }
}

/// Identity of one cached listing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CacheKey {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            path: normalize_remote_path(path),
        }
    }
}

#[derive(Default)]
struct CacheState {
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, Vec<FileEntry>>,
    /// Bumped by `clear`, so fetches started before it are not stored
    generation: u64,
}

/// Bounded listing cache; the oldest inserted key goes first
pub struct ListingCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ListingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<FileEntry>> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn insert(&self, key: CacheKey, entries: Vec<FileEntry>) {
        let mut state = self.state.lock();
        Self::insert_locked(&mut state, self.capacity, key, entries);
    }

    /// Insert unless the cache was cleared since `generation` was read
    pub fn insert_if_current(&self, generation: u64, key: CacheKey, entries: Vec<FileEntry>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        Self::insert_locked(&mut state, self.capacity, key, entries);
        true
    }

    fn insert_locked(state: &mut CacheState, capacity: usize, key: CacheKey, entries: Vec<FileEntry>) {
        state.order.retain(|k| k != &key);
        state.order.push_back(key.clone());
        state.entries.insert(key, entries);

        while state.order.len() > capacity {
            if let Some(oldest) = state.order.pop_front() {
                tracing::debug!("Evicting cached listing {}:{}", oldest.host, oldest.path);
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.order.clear();
        state.entries.clear();
        state.generation += 1;
    }
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// List a remote directory without `.`/`..`, in listing order
pub fn read_remote_dir(remote: &dyn RemoteFs, path: &str) -> XferResult<Vec<FileEntry>> {
    Ok(remote
        .read_dir(path)?
        .into_iter()
        .filter(|e| !e.is_pseudo())
        .map(FileEntry::from_dir_entry)
        .collect())
}

/// Local and remote directory navigation
pub struct FileBrowser {
    cache: ListingCache,
}

impl FileBrowser {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: ListingCache::new(cache_capacity),
        }
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    /// Read a local directory; missing or unreadable paths yield nothing
    pub fn list_local(&self, path: impl AsRef<Path>, sort: SortColumn, ascending: bool) -> Vec<FileEntry> {
        let path = path.as_ref();
        let mut entries = match read_local_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Local listing of {} failed: {}", path.display(), e);
                Vec::new()
            }
        };
        sort_entries(&mut entries, sort, ascending);
        entries
    }

    pub fn list_remote(
        &self,
        session: &Session,
        path: &str,
        sort: SortColumn,
        ascending: bool,
        force_refresh: bool,
    ) -> XferResult<Vec<FileEntry>> {
        if !session.is_connected() {
            return Ok(Vec::new());
        }

        let endpoint = session.endpoint();
        let key = CacheKey::new(&endpoint.host, endpoint.port, path);

        if !force_refresh {
            if let Some(mut cached) = self.cache.get(&key) {
                tracing::debug!("Listing cache hit: {}", key.path);
                sort_entries(&mut cached, sort, ascending);
                return Ok(cached);
            }
        }

        tracing::debug!("Listing cache miss: {}", key.path);
        let generation = self.cache.generation();
        let remote = session.remote()?;
        let entries = read_remote_dir(remote, path)?;
        self.cache.insert_if_current(generation, key, entries.clone());

        let mut entries = entries;
        sort_entries(&mut entries, sort, ascending);
        Ok(entries)
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
        tracing::debug!("Listing cache cleared");
    }

    pub fn rename(&self, session: &Session, old_path: &str, new_path: &str) -> XferResult<()> {
        ops::rename(session.remote()?, old_path, new_path)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn delete(&self, session: &Session, path: &str, is_dir: bool) -> XferResult<()> {
        ops::delete(session.remote()?, path, is_dir)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn create_directory(&self, session: &Session, path: &str) -> XferResult<()> {
        ops::create_directory(session.remote()?, path)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn write_text(&self, session: &Session, path: &str, content: &str) -> XferResult<()> {
        ops::write_text(session.remote()?, path, content)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn set_permissions(&self, session: &Session, path: &str, octal_mode: &str) -> XferResult<()> {
        ops::set_permissions(session.remote()?, path, octal_mode)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn compress(&self, session: &Session, path: &str) -> XferResult<String> {
        let archive = ops::compress(session.remote()?, path)?;
        self.invalidate_cache();
        Ok(archive)
    }

    pub fn extract(&self, session: &Session, archive_path: &str) -> XferResult<()> {
        ops::extract(session.remote()?, archive_path)?;
        self.invalidate_cache();
        Ok(())
    }
}

impl Default for FileBrowser {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn read_local_dir(path: &Path) -> std::io::Result<Vec<FileEntry>> {
    Ok(collect_local_entries(std::fs::read_dir(path)?))
}

/// Entries that fail to read are skipped; the rest of the directory still lists
fn collect_local_entries<I>(dir_entries: I) -> Vec<FileEntry>
where
    I: IntoIterator<Item = std::io::Result<std::fs::DirEntry>>,
{
    let mut entries = Vec::new();
    for entry in dir_entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let is_dir = metadata.is_dir();
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().to_string_lossy().to_string(),
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            permissions: None,
            is_local: true,
        });
    }
    entries
}
