//! KATCP common library
//!
//! This crate provides shared types and utilities for the KATCP bridge:
//!
//! - [`message`] - KATCP line codec (`Message`, `MessageKind`)
//! - [`sensor`] - Sensor model (`SensorType`, `SensorStatus`, `SensorValue`)
//! - [`config`] - Logging settings shared by the binaries
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod message;
pub mod sensor;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use message::{Message, MessageKind, ProtocolError};
pub use sensor::{SensorStatus, SensorType, SensorValue, ValueError};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
