//! Server Error Types

use thiserror::Error;

/// Fatal server-side errors.
///
/// Per-session I/O failures are not represented here; they terminate the
/// affected session only and are logged where they occur.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not bind the configured endpoint
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Accept loop ended with an I/O error
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
