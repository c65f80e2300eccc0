//! One-shot remote file helpers over a `RemoteFs`

use super::{remote_file_name, remote_parent, CommandOutput, RemoteFs, WriteMode};
use crate::error::{XferError, XferResult};
use crate::listing::FileEntry;
use crate::logging::sanitize;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::{Read, Write};

/// Prompt lines `sudo -S` writes into the merged output
const SUDO_PROMPTS: &[&str] = &["[sudo] password for", "[sudo] mot de passe de"];

const PERMISSION_MARKERS: &[&str] = &[
    "Permission denied",
    "Operation not permitted",
    "Sorry, try again",
];

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn run(remote: &dyn RemoteFs, command: &str) -> XferResult<CommandOutput> {
    tracing::debug!("Running remote command: {}", sanitize(command));
    remote.exec(command)
}

pub fn rename(remote: &dyn RemoteFs, old_path: &str, new_path: &str) -> XferResult<()> {
    remote.rename(old_path, new_path)?;
    tracing::info!("Renamed {} -> {}", old_path, new_path);
    Ok(())
}

pub fn delete(remote: &dyn RemoteFs, path: &str, is_dir: bool) -> XferResult<()> {
    if is_dir {
        remote.remove_dir(path)?;
    } else {
        remote.remove_file(path)?;
    }
    tracing::info!("Deleted {}", path);
    Ok(())
}

pub fn create_directory(remote: &dyn RemoteFs, path: &str) -> XferResult<()> {
    remote.mkdir(path)?;
    tracing::info!("Created directory {}", path);
    Ok(())
}

pub fn read_text(remote: &dyn RemoteFs, path: &str) -> XferResult<String> {
    let mut reader = remote.open_read(path, 0)?;
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    Ok(content)
}

/// Replace the file's content with `content`
pub fn write_text(remote: &dyn RemoteFs, path: &str, content: &str) -> XferResult<()> {
    let mut writer = remote.open_write(path, WriteMode::Truncate)?;
    writer.write_all(content.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Parse an octal mode string like `"755"`; `None` for blank input
pub fn parse_octal_mode(mode: &str) -> XferResult<Option<u32>> {
    let mode = mode.trim();
    if mode.is_empty() {
        return Ok(None);
    }
    u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .map(Some)
        .ok_or_else(|| XferError::Transfer(format!("Invalid octal mode: {}", mode)))
}

pub fn set_permissions(remote: &dyn RemoteFs, path: &str, octal_mode: &str) -> XferResult<()> {
    let Some(mode) = parse_octal_mode(octal_mode)? else {
        return Ok(());
    };
    remote.set_mode(path, mode)?;
    tracing::info!("Changed mode of {} to {:o}", path, mode);
    Ok(())
}

fn split_remote(path: &str) -> (String, String) {
    let directory = remote_parent(path).unwrap_or("/").to_string();
    (directory, remote_file_name(path).to_string())
}

/// Archive `path` into a timestamped `.tar.gz` next to it, returning the archive path
pub fn compress(remote: &dyn RemoteFs, path: &str) -> XferResult<String> {
    compress_at(remote, path, &Local::now())
}

pub(crate) fn compress_at(
    remote: &dyn RemoteFs,
    path: &str,
    now: &DateTime<Local>,
) -> XferResult<String> {
    let (directory, file_name) = split_remote(path);
    let archive_name = format!("{}_{}.tar.gz", file_name, now.format("%Y%m%d_%H%M%S"));

    let output = run(
        remote,
        &format!(
            "cd {} && tar -czf {} {}",
            shell_quote(&directory),
            shell_quote(&archive_name),
            shell_quote(&file_name)
        ),
    )?;

    if !output.success() {
        return Err(XferError::Transfer(format!(
            "Compression of {} failed: {}",
            path,
            sanitize(output.stderr.trim())
        )));
    }

    let archive_path = super::join_remote(&directory, &archive_name);
    tracing::info!("Archive created: {}", archive_path);
    Ok(archive_path)
}

/// Unpack an archive into its own directory
pub fn extract(remote: &dyn RemoteFs, archive_path: &str) -> XferResult<()> {
    let (directory, file_name) = split_remote(archive_path);
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    let tool = match extension.as_str() {
        "gz" | "tgz" => "tar -xzf",
        "bz2" => "tar -xjf",
        "zip" => "unzip",
        other => {
            return Err(XferError::Transfer(format!(
                "Unsupported archive format: .{}",
                other
            )))
        }
    };

    let output = run(
        remote,
        &format!(
            "cd {} && {} {}",
            shell_quote(&directory),
            tool,
            shell_quote(&file_name)
        ),
    )?;

    if !output.success() {
        return Err(XferError::Transfer(format!(
            "Extraction of {} failed: {}",
            archive_path,
            sanitize(output.stderr.trim())
        )));
    }

    tracing::info!("Archive extracted: {}", archive_path);
    Ok(())
}

/// Force-kill a remote process
pub fn stop_process(remote: &dyn RemoteFs, pid: &str) -> XferResult<()> {
    let pid = pid.trim();
    if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
        return Err(XferError::Transfer(format!("Invalid process id: {}", pid)));
    }

    let output = run(remote, &format!("kill -9 {}", pid))?;
    if !output.success() {
        return Err(XferError::Transfer(format!(
            "kill {} failed: {}",
            pid,
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Last `lines` lines of a remote file, optionally read through `sudo -S`
pub fn tail_log(
    remote: &dyn RemoteFs,
    path: &str,
    lines: u32,
    sudo_password: Option<&str>,
) -> XferResult<String> {
    let command = match sudo_password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "printf '%s\\n' {} | sudo -S tail -n {} {} 2>&1",
            shell_quote(password),
            lines,
            shell_quote(path)
        ),
        None => format!("tail -n {} {} 2>&1", lines, shell_quote(path)),
    };

    let output = run(remote, &command)?;
    let filtered = output
        .stdout
        .split('\n')
        .filter(|line| !SUDO_PROMPTS.iter().any(|p| line.contains(p)))
        .collect::<Vec<_>>()
        .join("\n");

    let filtered = filtered.trim();
    if PERMISSION_MARKERS.iter().any(|m| filtered.contains(m)) {
        return Ok(format!("[STDERR] {}", filtered));
    }
    Ok(filtered.to_string())
}

/// Describe one remote path as a file entry
pub fn stat_entry(remote: &dyn RemoteFs, path: &str) -> XferResult<FileEntry> {
    let stat = remote.stat(path)?;
    Ok(FileEntry::remote(remote_file_name(path).to_string(), path.to_string(), &stat))
}

/// Section separator in the status command's output
const STATUS_SPLIT: &str = "SPLIT";

/// One shell round trip that prints each metric section, separated by
/// `SPLIT` lines. Sections that fail on the host come back empty.
const STATUS_COMMAND: &str = concat!(
    "grep 'cpu ' /proc/stat | awk '{usage=($2+$4)*100/($2+$4+$5)} END {print usage}'; echo SPLIT; ",
    "free -m | awk 'NR==2{printf \"%s|%s\\n\", $3, $2}'; echo SPLIT; ",
    "df -h / | awk 'NR==2 {print $5}'; echo SPLIT; ",
    "uptime -p; echo SPLIT; ",
    "grep -E '^PRETTY_NAME=' /etc/os-release | cut -d= -f2 | tr -d '\"'; echo SPLIT; ",
    "ps -eo pid,user,comm,%cpu,%mem,state --sort=-%cpu; echo SPLIT; ",
    "grep -m1 'model name' /proc/cpuinfo | cut -d: -f2 | tr -s ' '; echo SPLIT; ",
    "nproc; echo SPLIT; ",
    "uname -r; echo SPLIT; ",
    "ip -o -4 route get 1.1.1.1 2>/dev/null | awk '{print $7 \"|\" $5}'; echo SPLIT; ",
    "df -h | grep '^/dev/' | awk '{print $1 \"|\" $2 \"|\" $5 \"|\" $6}'; echo SPLIT; ",
    "IFACE=$(ip -o -4 route get 1.1.1.1 2>/dev/null | awk '{print $5}'); ",
    "grep \"$IFACE:\" /proc/net/dev | awk '{print $2 \"|\" $10}'"
);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: String,
    pub user: String,
    pub command: String,
    pub cpu: String,
    pub mem: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub device: String,
    pub size: String,
    pub used_percent: String,
    pub mount: String,
}

/// Host metrics gathered in one command; anything the host did not report
/// is `None` or empty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStatus {
    pub cpu_percent: Option<f64>,
    pub ram_used_mb: Option<u64>,
    pub ram_total_mb: Option<u64>,
    pub root_disk_percent: Option<f64>,
    pub uptime: Option<String>,
    pub os_name: Option<String>,
    pub processes: Vec<ProcessInfo>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub kernel_version: Option<String>,
    pub ip_address: Option<String>,
    pub network_interface: Option<String>,
    pub disks: Vec<DiskUsage>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

impl ServerStatus {
    pub fn ram_percent(&self) -> Option<f64> {
        match (self.ram_used_mb, self.ram_total_mb) {
            (Some(used), Some(total)) if total > 0 => Some(used as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// CPU, memory, disk, network and process snapshot of the remote host
pub fn server_status(remote: &dyn RemoteFs) -> XferResult<ServerStatus> {
    let output = run(remote, STATUS_COMMAND)?;
    if !output.success() {
        tracing::debug!("Status command exited with {}", output.exit_code);
    }
    Ok(parse_server_status(&output.stdout))
}

fn parse_server_status(output: &str) -> ServerStatus {
    let mut sections: Vec<Vec<&str>> = vec![Vec::new()];
    for line in output.lines() {
        if line.trim() == STATUS_SPLIT {
            sections.push(Vec::new());
        } else if let Some(current) = sections.last_mut() {
            current.push(line);
        }
    }
    let section = |i: usize| sections.get(i).map(|s| s.as_slice()).unwrap_or(&[]);
    let first_line = |i: usize| {
        section(i)
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    };

    let mut status = ServerStatus {
        cpu_percent: first_line(0).and_then(|l| l.replace(',', ".").parse().ok()),
        root_disk_percent: first_line(2).and_then(|l| l.trim_end_matches('%').parse().ok()),
        uptime: first_line(3).map(str::to_string),
        os_name: first_line(4).map(str::to_string),
        cpu_model: first_line(6).map(str::to_string),
        cpu_cores: first_line(7).and_then(|l| l.parse().ok()),
        kernel_version: first_line(8).map(str::to_string),
        ..ServerStatus::default()
    };

    if let Some((used, total)) = first_line(1).and_then(|l| l.split_once('|')) {
        status.ram_used_mb = used.trim().parse().ok();
        status.ram_total_mb = total.trim().parse().ok();
    }

    status.processes = section(5)
        .iter()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 || cols[0] == "PID" {
                return None;
            }
            Some(ProcessInfo {
                pid: cols[0].to_string(),
                user: cols[1].to_string(),
                command: cols[2].to_string(),
                cpu: cols[3].to_string(),
                mem: cols[4].to_string(),
                state: cols[5].to_string(),
            })
        })
        .collect();

    if let Some(route) = first_line(9) {
        let mut parts = route.split('|').map(str::trim).filter(|p| !p.is_empty());
        status.ip_address = parts.next().map(str::to_string);
        status.network_interface = parts.next().map(str::to_string);
    }

    status.disks = section(10)
        .iter()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 4 {
                return None;
            }
            Some(DiskUsage {
                device: parts[0].to_string(),
                size: parts[1].to_string(),
                used_percent: parts[2].to_string(),
                mount: parts[3].to_string(),
            })
        })
        .collect();

    if let Some((rx, tx)) = first_line(11).and_then(|l| l.split_once('|')) {
        if let (Ok(rx), Ok(tx)) = (rx.trim().parse::<u64>(), tx.trim().parse::<u64>()) {
            status.rx_bytes = Some(rx);
            status.tx_bytes = Some(tx);
        }
    }

    status
}
