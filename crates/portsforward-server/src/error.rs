use std::path::PathBuf;
use thiserror::Error;

/// Forwarding engine errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Remove or change the rule for port {port}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Connection to destination {address} failed: {source}")]
    DialError {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to open data file {path:?}: {source}")]
    TapError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Stream pump task failed: {0}")]
    PumpFailed(String),
}
