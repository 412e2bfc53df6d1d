use std::path::Path;

use thiserror::Error;

/// Errors returned by the master and client APIs.
#[derive(Debug, Error)]
pub enum DcError {
    #[error("Bad parameter: {0}")]
    BadParam(String),

    #[error("Unknown work unit: {0}")]
    UnknownWu(String),

    #[error("Too many work units: {0}")]
    TooMany(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation not implemented by the {backend} backend: {operation}")]
    NotImpl {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classification of a [`DcError`] into the error codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    BadParam,
    UnknownWu,
    TooMany,
    System,
    Config,
    NotImpl,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::BadParam => write!(f, "ERR_BADPARAM"),
            ErrorCode::UnknownWu => write!(f, "ERR_UNKNOWN_WU"),
            ErrorCode::TooMany => write!(f, "ERR_TOOMANY"),
            ErrorCode::System => write!(f, "ERR_SYSTEM"),
            ErrorCode::Config => write!(f, "ERR_CONFIG"),
            ErrorCode::NotImpl => write!(f, "ERR_NOTIMPL"),
            ErrorCode::Internal => write!(f, "ERR_INTERNAL"),
        }
    }
}

impl DcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DcError::BadParam(_) => ErrorCode::BadParam,
            DcError::UnknownWu(_) => ErrorCode::UnknownWu,
            DcError::TooMany(_) => ErrorCode::TooMany,
            DcError::Io { .. } | DcError::Command { .. } => ErrorCode::System,
            DcError::Json(_) => ErrorCode::System,
            DcError::Config(_) | DcError::Toml(_) => ErrorCode::Config,
            DcError::NotImpl { .. } => ErrorCode::NotImpl,
            DcError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_not_impl(&self) -> bool {
        self.code() == ErrorCode::NotImpl
    }
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> DcError {
    DcError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn command_err(command: &str, message: impl Into<String>) -> DcError {
    DcError::Command {
        command: command.to_string(),
        message: message.into(),
    }
}
