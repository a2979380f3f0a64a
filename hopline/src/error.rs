use std::io;

use thiserror::Error;

/// Errors returned by the hopline core.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a socket or the readiness backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Host name did not resolve to any address.
    #[error("address resolution failed for {0}")]
    Resolve(String),
}
