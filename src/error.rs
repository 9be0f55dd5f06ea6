//! Error types for symdb

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for symdb operations
#[derive(Error, Debug)]
pub enum SymdbError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("project init failed: {message}")]
    ProjectInit { message: String },

    #[error("store error at {path}: {message}")]
    Kvs { path: PathBuf, message: String },

    #[error("configure command failed: {message}")]
    ConfigureFailed { message: String },

    #[error("clang parse failed: {message}")]
    ParseFailed { message: String },

    #[error("watch registration failed for {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SymdbError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn project_init(message: impl Into<String>) -> Self {
        Self::ProjectInit {
            message: message.into(),
        }
    }

    pub fn kvs(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Kvs {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Result type alias for symdb operations
pub type Result<T> = std::result::Result<T, SymdbError>;
