//! Sensor name filtering.

use crate::config::FilterConfig;

/// Include/exclude glob filter on sensor names.
#[derive(Debug, Clone, Default)]
pub struct SensorFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl SensorFilter {
    /// Create a new filter from configuration.
    ///
    /// Invalid patterns are skipped; configuration validation reports them.
    pub fn new(config: &FilterConfig) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect::<Vec<_>>()
        };

        Self {
            include: compile(&config.include_sensors),
            exclude: compile(&config.exclude_sensors),
        }
    }

    /// Check if a sensor should be subscribed and forwarded.
    pub fn accepts(&self, sensor: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(sensor)) {
            return false;
        }

        !self.exclude.iter().any(|p| p.matches(sensor))
    }

    /// Whether the filter lets every sensor through.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> SensorFilter {
        SensorFilter::new(&FilterConfig {
            include_sensors: include.iter().map(|s| s.to_string()).collect(),
            exclude_sensors: exclude.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_default_accepts_everything() {
        let filter = SensorFilter::default();
        assert!(filter.is_empty());
        assert!(filter.accepts("device.temp"));
    }

    #[test]
    fn test_include_patterns() {
        let filter = filter(&["device.*", "anc.weather.*"], &[]);
        assert!(filter.accepts("device.temp"));
        assert!(filter.accepts("anc.weather.wind-speed"));
        assert!(!filter.accepts("m000.ap.mode"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = filter(&["device.*"], &["*.debug*"]);
        assert!(filter.accepts("device.temp"));
        assert!(!filter.accepts("device.debug-counter"));
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let filter = filter(&[], &["[abc", "*.raw"]);
        assert!(!filter.is_empty());
        assert!(filter.accepts("device.temp"));
        assert!(!filter.accepts("device.raw"));
    }
}
