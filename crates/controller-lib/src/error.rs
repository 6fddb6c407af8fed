//! Error types for the controller
//!
//! Every variant here is recoverable: callers log, record a metric and keep
//! the last-known-good proxy configuration running.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by a coordination store client
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("store connection lost: {0}")]
    Connection(String),

    #[error("store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A node payload that could not be turned into an exported service
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid service payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service payload missing field {0}")]
    MissingField(&'static str),
}

/// Two services claiming the same externally reachable address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{address} claimed by both {first} and {second}")]
pub struct ConflictError {
    /// Human readable address, e.g. `a.com:80/` or `tcp:3306`
    pub address: String,
    pub first: String,
    pub second: String,
}

/// Errors from rendering, validating or activating proxy configuration
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to render configuration: {0}")]
    Render(String),

    #[error("config file operation on {path} failed: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("runtime socket {socket}: {message}")]
    Runtime { socket: String, message: String },
}

impl ProxyError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProxyError::File {
            path: path.into(),
            source,
        }
    }
}
