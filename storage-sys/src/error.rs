// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{call} failed for {path:?}: {source}")]
    Syscall {
        call: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path contains NUL byte: {0:?}")]
    InvalidPath(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
