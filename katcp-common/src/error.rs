use thiserror::Error;

use crate::message::ProtocolError;
use crate::sensor::ValueError;

/// Common error type for the KATCP bridge components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Sensor value error: {0}")]
    Value(#[from] ValueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the common [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
