pub mod hosts;
pub mod settings;

pub use hosts::*;
pub use settings::*;

use crate::error::{XferError, XferResult};
use std::path::PathBuf;

/// Get the remote-xfer config directory
pub fn get_config_dir() -> XferResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| XferError::Config("Could not find config directory".into()))?
        .join("remote-xfer");

    Ok(config_dir)
}
