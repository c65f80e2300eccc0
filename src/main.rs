use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use remote_xfer::config::get_config_dir;
use remote_xfer::listing::{FileEntry, SortColumn};
use remote_xfer::sftp::ops::{server_status, stat_entry, ServerStatus};
use remote_xfer::ssh::SharedSession;
use remote_xfer::transfer::{channel_sink, TransferProgress, TransferSummary};
use remote_xfer::TransferCore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Browse and move files over SSH, locally or between two servers
#[derive(Parser)]
#[command(name = "remote-xfer", version, about)]
struct Cli {
    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured hosts
    Hosts,

    /// Store the secret for a credential, read from stdin
    Secret {
        credential_id: String,
    },

    /// List a remote directory
    Ls {
        host: String,
        #[arg(default_value = ".")]
        path: String,
        /// name, size or modified
        #[arg(long, default_value = "name")]
        sort: SortColumn,
        #[arg(long)]
        desc: bool,
    },

    /// Show CPU, memory, disk and process usage of a host
    Status {
        host: String,
        /// Processes to show, busiest first
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Upload local files or directories
    Upload {
        host: String,
        /// Remote destination directory
        dest: String,
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Download remote files or directories
    Download {
        host: String,
        /// Local destination directory
        dest: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Copy between two hosts without staging locally
    Copy {
        from: String,
        to: String,
        /// Destination directory on the target host
        dest: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        "remote_xfer=debug,info"
    } else {
        remote_xfer::logging::DEFAULT_FILTER
    };
    remote_xfer::logging::init(filter);

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    let core = TransferCore::load(&config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;

    match cli.command {
        Commands::Hosts => {
            for host in core.inventory.read().list() {
                let via = host
                    .bastion
                    .as_ref()
                    .map(|b| format!(" via {:?}", b))
                    .unwrap_or_default();
                println!("{}\t{}@{}:{}{}", host.id, host.name, host.host, host.port, via);
            }
        }
        Commands::Secret { credential_id } => {
            let mut secret = String::new();
            std::io::stdin().read_line(&mut secret)?;
            core.vault
                .store_secret(&credential_id, secret.trim_end_matches(&['\r', '\n'][..]))?;
            println!("Stored secret for {}", credential_id);
        }
        Commands::Ls {
            host,
            path,
            sort,
            desc,
        } => {
            let session = core.connect(&host)?;
            let entries = core.browser.list_remote(&session, &path, sort, !desc, false)?;
            for entry in entries {
                let mode = entry
                    .permissions
                    .clone()
                    .unwrap_or_else(|| if entry.is_dir { "d".into() } else { "-".into() });
                let modified = entry
                    .modified
                    .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:<10} {:>10} {:>16} {}", mode, entry.size_display(), modified, entry.name);
            }
        }
        Commands::Status { host, top } => {
            let session = core.connect(&host)?;
            let status = server_status(session.remote()?)?;
            print_status(&status, top);
        }
        Commands::Upload {
            host,
            dest,
            sources,
        } => {
            let session = core.connect(&host)?.into_shared();
            let (sink, cancel) = progress_and_cancel();
            let summary = core
                .engine
                .upload_async(session, sources, dest, sink, cancel)
                .await?;
            print_summary(&summary);
        }
        Commands::Download { host, dest, paths } => {
            let session = core.connect(&host)?.into_shared();
            let items = stat_all(&session, &paths)?;
            let (sink, cancel) = progress_and_cancel();
            let summary = core
                .engine
                .download_async(session, items, dest, sink, cancel)
                .await?;
            print_summary(&summary);
        }
        Commands::Copy {
            from,
            to,
            dest,
            paths,
        } => {
            let source = core.connect(&from)?.into_shared();
            let target = core.connect(&to)?.into_shared();
            let items = stat_all(&source, &paths)?;
            let (sink, cancel) = progress_and_cancel();
            let summary = core
                .engine
                .transfer_between_servers_async(source, target, items, dest, sink, cancel)
                .await?;
            print_summary(&summary);
            if !summary.failed_files.is_empty() {
                bail!("{} file(s) failed", summary.failed_files.len());
            }
        }
    }

    Ok(())
}

fn stat_all(session: &SharedSession, paths: &[String]) -> Result<Vec<FileEntry>> {
    let session = session.lock();
    let remote = session.remote()?;
    paths
        .iter()
        .map(|p| stat_entry(remote, p).with_context(|| format!("Cannot stat {}", p)))
        .collect()
}

/// Progress goes to the log; Ctrl-C cancels the running transfer
fn progress_and_cancel() -> (Arc<dyn remote_xfer::transfer::ProgressSink>, CancellationToken) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TransferProgress>();
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            tracing::info!("{}", progress.message);
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });

    (Arc::new(channel_sink(tx)), cancel)
}

fn print_summary(summary: &TransferSummary) {
    println!(
        "{} file(s), {} transferred ({} resumed)",
        summary.files_transferred,
        remote_xfer::transfer::format_bytes(summary.bytes_transferred),
        summary.resumed_files
    );
    for dir in &summary.skipped_dirs {
        println!("skipped {}", dir);
    }
    for (path, error) in &summary.failed_files {
        println!("failed {}: {}", path, error);
    }
    for warning in &summary.integrity_warnings {
        println!(
            "checksum mismatch {} (local {}, remote {})",
            warning.remote_path, warning.local_hash, warning.remote_hash
        );
    }
}

fn print_status(status: &ServerStatus, top: usize) {
    let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "?".into());
    println!("os      {} (kernel {})", or_unknown(&status.os_name), or_unknown(&status.kernel_version));
    println!("uptime  {}", or_unknown(&status.uptime));
    if let Some(cpu) = status.cpu_percent {
        let cores = status.cpu_cores.map(|c| format!(", {} cores", c)).unwrap_or_default();
        println!("cpu     {:.1}%{}", cpu, cores);
    }
    if let (Some(used), Some(total), Some(percent)) =
        (status.ram_used_mb, status.ram_total_mb, status.ram_percent())
    {
        println!(
            "ram     {:.1}% ({}/{})",
            percent,
            remote_xfer::transfer::format_bytes(used * 1024 * 1024),
            remote_xfer::transfer::format_bytes(total * 1024 * 1024)
        );
    }
    for disk in &status.disks {
        println!("disk    {} {} {} of {}", disk.mount, disk.device, disk.used_percent, disk.size);
    }
    if let Some(ip) = &status.ip_address {
        println!("net     {} on {}", ip, or_unknown(&status.network_interface));
    }
    for process in status.processes.iter().take(top) {
        println!(
            "{:>7} {:<10} {:>5} {:>5} {} {}",
            process.pid, process.user, process.cpu, process.mem, process.state, process.command
        );
    }
}
