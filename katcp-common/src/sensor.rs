//! KATCP sensor model: declared types, statuses and typed values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding sensor fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("invalid float value {0:?}")]
    InvalidFloat(String),

    #[error("invalid integer value {0:?}")]
    InvalidInteger(String),

    #[error("invalid boolean value {0:?} (expected 0 or 1)")]
    InvalidBoolean(String),

    #[error("invalid timestamp value {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid sensor status {0:?}")]
    InvalidStatus(String),

    #[error("sensor type {0} carries no decodable value")]
    Unsupported(SensorType),
}

/// Sensor type as declared by the device in `#sensor-list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Float,
    Integer,
    Boolean,
    Discrete,
    String,
    Address,
    Timestamp,
    /// Type name not understood, or a sensor seen before its declaration.
    Unknown,
}

impl SensorType {
    /// Map a KATCP type name onto a sensor type.
    ///
    /// Unrecognised names map to [`SensorType::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "float" => Self::Float,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "discrete" => Self::Discrete,
            "string" => Self::String,
            "address" => Self::Address,
            "timestamp" => Self::Timestamp,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Discrete => "discrete",
            Self::String => "string",
            Self::Address => "address",
            Self::Timestamp => "timestamp",
            Self::Unknown => "unknown",
        }
    }

    /// Whether values of this type are free text with no numeric meaning.
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::String | Self::Address)
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sensor status reported alongside every value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    #[default]
    Unknown,
    Nominal,
    Warn,
    Error,
    Failure,
    Unreachable,
    Inactive,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Nominal => "nominal",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Failure => "failure",
            Self::Unreachable => "unreachable",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for SensorStatus {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "nominal" => Ok(Self::Nominal),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "failure" => Ok(Self::Failure),
            "unreachable" => Ok(Self::Unreachable),
            "inactive" => Ok(Self::Inactive),
            other => Err(ValueError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed sensor value.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Discrete(String),
    String(String),
    Address(String),
    /// Seconds since the Unix epoch.
    Timestamp(f64),
}

impl SensorValue {
    /// Decode the raw argument text of a `#sensor-status` inform.
    pub fn decode(sensor_type: SensorType, raw: &str) -> Result<Self, ValueError> {
        match sensor_type {
            SensorType::Float => raw
                .parse::<f64>()
                .map(Self::Float)
                .map_err(|_| ValueError::InvalidFloat(raw.to_string())),
            SensorType::Integer => raw
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|_| ValueError::InvalidInteger(raw.to_string())),
            SensorType::Boolean => match raw {
                "1" => Ok(Self::Boolean(true)),
                "0" => Ok(Self::Boolean(false)),
                _ => Err(ValueError::InvalidBoolean(raw.to_string())),
            },
            SensorType::Timestamp => raw
                .parse::<f64>()
                .map(Self::Timestamp)
                .map_err(|_| ValueError::InvalidTimestamp(raw.to_string())),
            SensorType::Discrete => Ok(Self::Discrete(raw.to_string())),
            SensorType::String => Ok(Self::String(raw.to_string())),
            SensorType::Address => Ok(Self::Address(raw.to_string())),
            SensorType::Unknown => Err(ValueError::Unsupported(sensor_type)),
        }
    }

    pub fn sensor_type(&self) -> SensorType {
        match self {
            Self::Float(_) => SensorType::Float,
            Self::Integer(_) => SensorType::Integer,
            Self::Boolean(_) => SensorType::Boolean,
            Self::Discrete(_) => SensorType::Discrete,
            Self::String(_) => SensorType::String,
            Self::Address(_) => SensorType::Address,
            Self::Timestamp(_) => SensorType::Timestamp,
        }
    }

    /// The raw text of categorical values (discrete, string, address).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Discrete(s) | Self::String(s) | Self::Address(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) | Self::Timestamp(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            Self::Discrete(s) | Self::String(s) | Self::Address(s) => write!(f, "{}", s),
        }
    }
}
