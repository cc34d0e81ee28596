//! Error types for device watching

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    /// The device subsystem or a monitoring session could not be opened
    #[error("Cannot connect to device subsystem: {0}")]
    Connection(String),
    /// A topology query found no matching device
    #[error("No matching device: {0}")]
    NotFound(String),
    #[error("Enumeration failed: {0}")]
    Enumeration(String),
    #[error("Monitor read failed: {0}")]
    Monitor(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Whether this is the expected "nothing matched" outcome of a topology query
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
