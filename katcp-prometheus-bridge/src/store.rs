//! Sensor store holding the latest state of every known sensor.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use katcp_common::{SensorStatus, SensorType, SensorValue};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::PrometheusConfig;
use crate::event::ConnectionState;
use crate::mapping::{Projection, build_metric_name};
use crate::registry::CategoricalRegistry;

/// Name of the gauge describing the device connection.
pub const SYNC_STATE_METRIC: &str = "katcp_sync_state";

/// Static description of a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    pub name: String,
    pub sensor_type: SensorType,
    pub description: String,
    pub units: String,
}

impl SensorDescriptor {
    pub fn new(
        name: impl Into<String>,
        sensor_type: SensorType,
        description: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            sensor_type,
            description: description.into(),
            units: units.into(),
        }
    }

    /// Descriptor for a sensor whose declaration has not been seen.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::new(name, SensorType::Unknown, "", "")
    }
}

/// Latest reading of a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub value: SensorValue,
    pub status: SensorStatus,
    /// Device timestamp, seconds since the Unix epoch.
    pub timestamp: f64,
    pub projection: Projection,
}

/// An immutable gauge ready for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedMetric {
    /// Sanitized Prometheus metric name.
    pub metric_name: String,
    /// KATCP sensor name.
    pub sensor: String,
    pub help: String,
    pub value: f64,
}

/// Outcome of registering a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration {
    /// First time the sensor was seen.
    Added,
    /// Same type as before; help text and legal values refreshed.
    Refreshed,
    /// A sensor previously seen only in updates now has a type.
    Upgraded,
    /// Declared with a different type; the existing descriptor is kept.
    Conflict { existing: SensorType },
}

#[derive(Debug)]
struct SensorRecord {
    descriptor: SensorDescriptor,
    sample: Option<SensorSample>,
    exposed: Option<Arc<ExposedMetric>>,
}

impl SensorRecord {
    fn new(descriptor: SensorDescriptor) -> Self {
        Self {
            descriptor,
            sample: None,
            exposed: None,
        }
    }
}

/// Thread-safe sensor store.
///
/// Written by a single watcher, read concurrently by HTTP handlers. Exposed
/// metrics are swapped in whole, so a reader never observes a partly
/// updated entry.
pub struct SensorStore {
    sensors: RwLock<BTreeMap<String, SensorRecord>>,
    registry: CategoricalRegistry,
    state: RwLock<ConnectionState>,
    config: PrometheusConfig,
}

/// Create a shareable store handle.
pub type SharedStore = Arc<SensorStore>;

impl SensorStore {
    pub fn new(config: PrometheusConfig) -> Self {
        Self {
            sensors: RwLock::new(BTreeMap::new()),
            registry: CategoricalRegistry::new(),
            state: RwLock::new(ConnectionState::default()),
            config,
        }
    }

    /// Categorical indices of all sensors.
    pub fn registry(&self) -> &CategoricalRegistry {
        &self.registry
    }

    /// Register a declared sensor.
    ///
    /// Legal values are only recorded for discrete sensors.
    pub fn declare(&self, descriptor: SensorDescriptor, legal_values: &[String]) -> Declaration {
        let name = descriptor.name.clone();
        let sensor_type = descriptor.sensor_type;

        let outcome = {
            let mut sensors = self.sensors.write();
            match sensors.get_mut(&name) {
                None => {
                    sensors.insert(name.clone(), SensorRecord::new(descriptor));
                    Declaration::Added
                }
                Some(record) if record.descriptor.sensor_type == sensor_type => {
                    record.descriptor = descriptor;
                    Declaration::Refreshed
                }
                Some(record) if record.descriptor.sensor_type == SensorType::Unknown => {
                    record.descriptor = descriptor;
                    Declaration::Upgraded
                }
                Some(record) => Declaration::Conflict {
                    existing: record.descriptor.sensor_type,
                },
            }
        };

        if sensor_type == SensorType::Discrete && !matches!(outcome, Declaration::Conflict { .. })
        {
            self.registry.declare(&name, legal_values);
        }

        if outcome == Declaration::Refreshed {
            self.refresh_help(&name);
        }

        outcome
    }

    /// Descriptor of `name`, if the sensor is known.
    pub fn descriptor(&self, name: &str) -> Option<SensorDescriptor> {
        self.sensors
            .read()
            .get(name)
            .map(|record| record.descriptor.clone())
    }

    /// Descriptor of `name`, creating an `unknown` one if the sensor has not
    /// been declared.
    pub fn declare_unknown(&self, name: &str) -> SensorDescriptor {
        self.sensors
            .write()
            .entry(name.to_string())
            .or_insert_with(|| SensorRecord::new(SensorDescriptor::unknown(name)))
            .descriptor
            .clone()
    }

    /// Store a new sample for a sensor.
    ///
    /// A gauge projection replaces the exposed metric; a suppressed one leaves
    /// the previously exposed value in place. Returns the exposed metric, if
    /// any.
    pub fn upsert(
        &self,
        descriptor: &SensorDescriptor,
        sample: SensorSample,
    ) -> Option<Arc<ExposedMetric>> {
        let name = &descriptor.name;

        let exposed = sample.projection.value().map(|value| {
            let legend = sample
                .value
                .as_text()
                .and_then(|_| self.registry.legend(name));
            Arc::new(ExposedMetric {
                metric_name: build_metric_name(&self.config.prefix, name),
                sensor: name.clone(),
                help: build_help(descriptor, legend.as_deref()),
                value,
            })
        });

        let mut sensors = self.sensors.write();
        let record = sensors
            .entry(name.clone())
            .or_insert_with(|| SensorRecord::new(descriptor.clone()));
        record.sample = Some(sample);
        if let Some(metric) = &exposed {
            record.exposed = Some(metric.clone());
        }

        record.exposed.clone()
    }

    /// Latest sample of `name`.
    pub fn sample(&self, name: &str) -> Option<SensorSample> {
        self.sensors
            .read()
            .get(name)
            .and_then(|record| record.sample.clone())
    }

    /// Point-in-time view of all exposed metrics, ordered by sensor name.
    pub fn snapshot(&self) -> Vec<Arc<ExposedMetric>> {
        self.sensors
            .read()
            .values()
            .filter_map(|record| record.exposed.clone())
            .collect()
    }

    /// Number of known sensors, exposed or not.
    pub fn sensor_count(&self) -> usize {
        self.sensors.read().len()
    }

    /// Number of sensors with an exposed metric.
    pub fn exposed_count(&self) -> usize {
        self.sensors
            .read()
            .values()
            .filter(|record| record.exposed.is_some())
            .count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Record the connection state, returning the previous one.
    pub fn set_connection_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        let metrics = self.snapshot();
        let mut output = Vec::with_capacity(metrics.len() * 100);
        let mut seen: HashSet<&str> = HashSet::with_capacity(metrics.len() + 1);

        if self.config.expose_sync_state {
            seen.insert(SYNC_STATE_METRIC);
        }

        for metric in &metrics {
            if !seen.insert(&metric.metric_name) {
                warn!(
                    sensor = %metric.sensor,
                    metric = %metric.metric_name,
                    "Metric name already in use, skipping sensor"
                );
                continue;
            }

            writeln!(
                output,
                "# HELP {} {}",
                metric.metric_name,
                escape_help(&metric.help)
            )
            .ok();
            writeln!(output, "# TYPE {} gauge", metric.metric_name).ok();
            writeln!(
                output,
                "{} {}",
                metric.metric_name,
                format_value(metric.value)
            )
            .ok();
        }

        if self.config.expose_sync_state {
            let legend = ConnectionState::ALL
                .iter()
                .map(|s| format!("{}={}", s.index(), s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");

            writeln!(
                output,
                "# HELP {} KATCP device connection state [{}]",
                SYNC_STATE_METRIC, legend
            )
            .ok();
            writeln!(output, "# TYPE {} gauge", SYNC_STATE_METRIC).ok();
            writeln!(
                output,
                "{} {}",
                SYNC_STATE_METRIC,
                self.connection_state().index()
            )
            .ok();
        }

        String::from_utf8(output).unwrap_or_default()
    }

    fn refresh_help(&self, name: &str) {
        let legend = self.registry.legend(name);
        let mut sensors = self.sensors.write();
        let Some(record) = sensors.get_mut(name) else {
            return;
        };
        let Some(current) = record.exposed.as_ref() else {
            return;
        };

        let categorical = record
            .sample
            .as_ref()
            .is_some_and(|sample| sample.value.as_text().is_some());
        let help = build_help(
            &record.descriptor,
            legend.as_deref().filter(|_| categorical),
        );
        if help != current.help {
            debug!(sensor = %name, "Refreshed help text");
            record.exposed = Some(Arc::new(ExposedMetric {
                help,
                ..ExposedMetric::clone(current)
            }));
        }
    }
}

/// Help text for a sensor, with the value legend of categorical sensors.
fn build_help(descriptor: &SensorDescriptor, legend: Option<&str>) -> String {
    let description = if descriptor.description.is_empty() {
        descriptor.name.as_str()
    } else {
        descriptor.description.as_str()
    };

    match legend {
        Some(legend) => format!("{} [{}]", description, legend),
        None => description.to_string(),
    }
}

/// Escape backslashes and newlines in help text.
fn escape_help(help: &str) -> String {
    let mut result = String::with_capacity(help.len());
    for c in help.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
