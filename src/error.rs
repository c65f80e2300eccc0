use serde::Serialize;
use thiserror::Error;

/// Error types for sessions, listings and transfers
#[derive(Error, Debug)]
pub enum XferError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),
}

impl XferError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            XferError::Connection(_) => "CONNECTION_ERROR",
            XferError::Auth(_) => "AUTH_ERROR",
            XferError::Transfer(_) => "TRANSFER_ERROR",
            XferError::PermissionDenied(_) => "PERMISSION_DENIED",
            XferError::NotFound(_) => "NOT_FOUND",
            XferError::AlreadyExists(_) => "ALREADY_EXISTS",
            XferError::Cancelled => "CANCELLED",
            XferError::Io(_) => "IO_ERROR",
            XferError::Config(_) => "CONFIG_ERROR",
            XferError::Keychain(_) => "KEYCHAIN_ERROR",
            XferError::Serialization(_) => "SERIALIZATION_ERROR",
            XferError::HostNotFound(_) => "HOST_NOT_FOUND",
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            XferError::NotFound(_) => true,
            XferError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            XferError::PermissionDenied(_) => true,
            XferError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, XferError::Cancelled)
    }
}

/// Serializable error for callers that forward failures to a UI
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
}

impl From<&XferError> for SerializableError {
    fn from(err: &XferError) -> Self {
        let message = match err {
            // Never forward the raw auth failure text
            XferError::Auth(_) => "Authentication failed".to_string(),
            other => other.to_string(),
        };

        SerializableError {
            code: err.code().to_string(),
            message,
        }
    }
}

impl Serialize for XferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for XferError {
    fn from(err: toml::de::Error) -> Self {
        XferError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for XferError {
    fn from(err: toml::ser::Error) -> Self {
        XferError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for XferError {
    fn from(err: serde_json::Error) -> Self {
        XferError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for XferError {
    fn from(err: keyring::Error) -> Self {
        XferError::Keychain(err.to_string())
    }
}

// libssh2 SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_FILE_ALREADY_EXISTS: i32 = 11;

impl From<ssh2::Error> for XferError {
    fn from(err: ssh2::Error) -> Self {
        let message = err.message().to_string();
        match err.code() {
            ssh2::ErrorCode::SFTP(FX_NO_SUCH_FILE) | ssh2::ErrorCode::SFTP(FX_NO_SUCH_PATH) => {
                XferError::NotFound(message)
            }
            ssh2::ErrorCode::SFTP(FX_PERMISSION_DENIED) => XferError::PermissionDenied(message),
            ssh2::ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => XferError::AlreadyExists(message),
            _ => XferError::Transfer(err.to_string()),
        }
    }
}

pub type XferResult<T> = Result<T, XferError>;
