//! Events passed from the KATCP client to the sensor watcher.

use std::fmt;

use katcp_common::{Message, SensorStatus, SensorType, ValueError};
use thiserror::Error;

/// Errors produced while turning an inform into events.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
    #[error("#{inform} inform has {found} arguments, expected at least {expected}")]
    TooFewArguments {
        inform: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid sensor count {0:?}")]
    InvalidCount(String),

    #[error("#sensor-status announces {announced} readings but carries {found}")]
    CountMismatch { announced: usize, found: usize },

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// State of the device connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 3] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Subscribed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
        }
    }

    /// Numeric value exposed by the `katcp_sync_state` gauge.
    pub fn index(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Subscribed => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A sensor announced by a `#sensor-list` inform.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDeclaration {
    pub name: String,
    pub description: String,
    pub units: String,
    /// Type name as sent by the device.
    pub type_name: String,
    /// Type parameters; the legal values of a discrete sensor.
    pub params: Vec<String>,
}

impl SensorDeclaration {
    /// Decode `#sensor-list <name> <description> <units> <type> [params...]`.
    pub fn from_inform(message: &Message) -> Result<Self, EventError> {
        let args = &message.arguments;
        if args.len() < 4 {
            return Err(EventError::TooFewArguments {
                inform: "sensor-list",
                expected: 4,
                found: args.len(),
            });
        }

        Ok(Self {
            name: args[0].clone(),
            description: args[1].clone(),
            units: args[2].clone(),
            type_name: args[3].clone(),
            params: args[4..].to_vec(),
        })
    }

    pub fn sensor_type(&self) -> SensorType {
        SensorType::from_name(&self.type_name)
    }
}

/// One reading carried by a `#sensor-status` inform.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorUpdate {
    pub name: String,
    /// Device timestamp, seconds since the Unix epoch.
    pub timestamp: f64,
    pub status: SensorStatus,
    /// Value text, decoded later against the sensor's declared type.
    pub raw_value: String,
}

impl SensorUpdate {
    /// Decode `#sensor-status <timestamp> <count> (<name> <status> <value>)...`.
    pub fn from_inform(message: &Message) -> Result<Vec<Self>, EventError> {
        let args = &message.arguments;
        if args.len() < 2 {
            return Err(EventError::TooFewArguments {
                inform: "sensor-status",
                expected: 2,
                found: args.len(),
            });
        }

        let timestamp = args[0]
            .parse::<f64>()
            .map_err(|_| EventError::InvalidTimestamp(args[0].clone()))?;
        let announced = args[1]
            .parse::<usize>()
            .map_err(|_| EventError::InvalidCount(args[1].clone()))?;

        let readings = &args[2..];
        if readings.len() % 3 != 0 || readings.len() / 3 != announced {
            return Err(EventError::CountMismatch {
                announced,
                found: readings.len() / 3,
            });
        }

        readings
            .chunks_exact(3)
            .map(|reading| -> Result<Self, EventError> {
                Ok(Self {
                    name: reading[0].clone(),
                    timestamp,
                    status: reading[1].parse()?,
                    raw_value: reading[2].clone(),
                })
            })
            .collect()
    }
}

/// Everything the watcher needs to know about the device, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Declared(SensorDeclaration),
    Updated(SensorUpdate),
    InterfaceChanged,
    StateChanged(ConnectionState),
}
