//! remote-xfer
//!
//! SSH sessions (optionally through a bastion), cached remote directory
//! listings, and a resumable, bounded-concurrency transfer engine covering
//! uploads, downloads and direct server-to-server copies.

pub mod config;
pub mod error;
pub mod keychain;
pub mod listing;
pub mod logging;
pub mod sftp;
pub mod ssh;
pub mod state;
pub mod transfer;

#[cfg(test)]
mod testutil;

pub use error::{XferError, XferResult};
pub use state::TransferCore;
