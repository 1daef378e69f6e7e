//! Mapping from KATCP sensor values to Prometheus gauges.

use katcp_common::SensorValue;

use crate::registry::CategoricalRegistry;

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;
    let mut chars = name.chars().peekable();

    // A leading digit is kept behind an underscore
    if let Some(&first) = chars.peek()
        && first.is_ascii_digit()
    {
        result.push('_');
        last_was_underscore = true;
    }

    for c in chars {
        let is_valid_char = c.is_ascii_alphanumeric() || c == '_' || c == ':';

        if is_valid_char {
            if c == '_' {
                if !last_was_underscore {
                    result.push(c);
                    last_was_underscore = true;
                }
            } else {
                result.push(c);
                last_was_underscore = false;
            }
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Build a full Prometheus metric name for a sensor.
///
/// Format: `{prefix}_{sensor}`, or just the sanitized sensor name when the
/// prefix is empty.
pub fn build_metric_name(prefix: &str, sensor: &str) -> String {
    let sanitized = sanitize_metric_name(sensor);

    if prefix.is_empty() {
        sanitized
    } else {
        format!("{}_{}", prefix, sanitized)
    }
}

/// Result of projecting one sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Value exposed as a gauge.
    Gauge(f64),
    /// No metric is emitted for this sample.
    Suppressed,
}

impl Projection {
    pub fn value(&self) -> Option<f64> {
        match self {
            Projection::Gauge(v) => Some(*v),
            Projection::Suppressed => None,
        }
    }
}

/// Project a typed sensor value onto a gauge.
///
/// Categorical values are looked up (and appended on first sight) in the
/// sensor's index within `registry`. Textual values are suppressed unless
/// `workaround_strings` is set.
pub fn project(
    sensor: &str,
    value: &SensorValue,
    registry: &CategoricalRegistry,
    workaround_strings: bool,
) -> Projection {
    match value {
        SensorValue::Float(v) | SensorValue::Timestamp(v) => Projection::Gauge(*v),
        SensorValue::Integer(v) => Projection::Gauge(*v as f64),
        SensorValue::Boolean(v) => Projection::Gauge(if *v { 1.0 } else { 0.0 }),
        SensorValue::Discrete(text) => Projection::Gauge(registry.index_of(sensor, text) as f64),
        SensorValue::String(text) | SensorValue::Address(text) => {
            if workaround_strings {
                Projection::Gauge(registry.index_of(sensor, text) as f64)
            } else {
                Projection::Suppressed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_metric_name_simple() {
        assert_eq!(sanitize_metric_name("cpu_usage"), "cpu_usage");
        assert_eq!(sanitize_metric_name("device.temp"), "device_temp");
    }

    #[test]
    fn test_sanitize_metric_name_katcp_names() {
        assert_eq!(
            sanitize_metric_name("anc.weather.wind-speed"),
            "anc_weather_wind_speed"
        );
        assert_eq!(sanitize_metric_name("m000.ap.mode"), "m000_ap_mode");
        assert_eq!(sanitize_metric_name("a..b"), "a_b");
    }

    #[test]
    fn test_sanitize_metric_name_leading_number() {
        assert_eq!(sanitize_metric_name("1pps.offset"), "_1pps_offset");
    }

    #[test]
    fn test_sanitize_metric_name_empty() {
        assert_eq!(sanitize_metric_name(""), "unnamed");
        assert_eq!(sanitize_metric_name("..."), "unnamed");
    }

    #[test]
    fn test_sanitize_metric_name_colons() {
        assert_eq!(sanitize_metric_name("foo:bar"), "foo:bar");
    }

    #[test]
    fn test_build_metric_name() {
        assert_eq!(build_metric_name("", "device.temp"), "device_temp");
        assert_eq!(build_metric_name("katcp", "device.temp"), "katcp_device_temp");
    }

    #[test]
    fn test_project_numeric() {
        let registry = CategoricalRegistry::new();
        assert_eq!(
            project("s", &SensorValue::Float(23.5), &registry, false),
            Projection::Gauge(23.5)
        );
        assert_eq!(
            project("s", &SensorValue::Integer(42), &registry, false),
            Projection::Gauge(42.0)
        );
        assert_eq!(
            project("s", &SensorValue::Timestamp(1564985117.5), &registry, false),
            Projection::Gauge(1564985117.5)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_project_boolean() {
        let registry = CategoricalRegistry::new();
        assert_eq!(
            project("s", &SensorValue::Boolean(true), &registry, false),
            Projection::Gauge(1.0)
        );
        assert_eq!(
            project("s", &SensorValue::Boolean(false), &registry, false),
            Projection::Gauge(0.0)
        );
    }

    #[test]
    fn test_project_discrete_uses_declared_order() {
        let registry = CategoricalRegistry::new();
        registry.declare(
            "device.mode",
            &["idle".to_string(), "running".to_string(), "error".to_string()],
        );

        let running = SensorValue::Discrete("running".to_string());
        assert_eq!(
            project("device.mode", &running, &registry, false),
            Projection::Gauge(1.0)
        );

        let unseen = SensorValue::Discrete("maintenance".to_string());
        assert_eq!(
            project("device.mode", &unseen, &registry, false),
            Projection::Gauge(3.0)
        );
    }

    #[test]
    fn test_project_strings_suppressed_without_workaround() {
        let registry = CategoricalRegistry::new();
        let value = SensorValue::String("A".to_string());
        assert_eq!(
            project("device.label", &value, &registry, false),
            Projection::Suppressed
        );
        let value = SensorValue::Address("1.2.3.4:7147".to_string());
        assert_eq!(
            project("device.addr", &value, &registry, false),
            Projection::Suppressed
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_project_strings_with_workaround() {
        let registry = CategoricalRegistry::new();
        let a = SensorValue::String("A".to_string());
        let b = SensorValue::String("B".to_string());

        assert_eq!(project("label", &a, &registry, true), Projection::Gauge(0.0));
        assert_eq!(project("label", &b, &registry, true), Projection::Gauge(1.0));
        assert_eq!(project("label", &a, &registry, true), Projection::Gauge(0.0));
    }

    #[test]
    fn test_projection_value() {
        assert_eq!(Projection::Gauge(2.0).value(), Some(2.0));
        assert_eq!(Projection::Suppressed.value(), None);
    }
}
