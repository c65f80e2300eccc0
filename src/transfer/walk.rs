//! Local tree scanning for uploads

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A local file and its path relative to the upload destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    pub local_path: PathBuf,
    /// `/`-separated, starting with the source directory's own name
    pub relative: String,
    pub size: u64,
}

/// Expand upload sources into files. Directories are walked depth first,
/// files before subdirectories; unreadable entries and missing sources are
/// skipped.
pub fn scan_local_sources(sources: &[PathBuf]) -> Vec<LocalItem> {
    let mut items = Vec::new();
    for source in sources {
        let base = file_name(source);
        let walker = WalkDir::new(source)
            .follow_links(true)
            .sort_by(|a, b| {
                a.file_type()
                    .is_dir()
                    .cmp(&b.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry under {}: {}", source.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            items.push(LocalItem {
                relative: relative_name(&base, source, entry.path()),
                local_path: entry.into_path(),
                size,
            });
        }
    }
    items
}

/// `base/sub/file` for an entry below `root`, just `base` for the root itself
fn relative_name(base: &str, root: &Path, path: &Path) -> String {
    let below = path.strip_prefix(root).unwrap_or(path);
    let mut relative = base.to_string();
    for part in below.components() {
        relative.push('/');
        relative.push_str(&part.as_os_str().to_string_lossy());
    }
    relative
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Destination path under a remote directory
pub fn remote_destination(dest_dir: &str, relative: &str) -> String {
    format!("{}/{}", dest_dir.trim_end_matches('/'), relative.replace('\\', "/"))
}
