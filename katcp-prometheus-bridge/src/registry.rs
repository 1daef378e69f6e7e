//! Stable integer indices for categorical sensor values.
//!
//! Discrete sensors (and, with the string workaround, string and address
//! sensors) have no numeric meaning, so each distinct value is given the next
//! free index the first time it is seen. Indices never change afterwards.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Ordered, append-only list of the values seen for one sensor.
#[derive(Debug, Clone, Default)]
pub struct CategoricalIndex {
    values: Vec<String>,
    positions: HashMap<String, usize>,
}

impl CategoricalIndex {
    /// Build an index pre-populated with `values` in order.
    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        for value in values {
            index.index_of(value.as_ref());
        }
        index
    }

    /// Index of `value`, appending it on first sight.
    pub fn index_of(&mut self, value: &str) -> usize {
        if let Some(&position) = self.positions.get(value) {
            return position;
        }
        let position = self.values.len();
        self.values.push(value.to_string());
        self.positions.insert(value.to_string(), position);
        position
    }

    /// Index of `value` if it has been seen.
    pub fn get(&self, value: &str) -> Option<usize> {
        self.positions.get(value).copied()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `0=idle, 1=running, 2=error`
    pub fn legend(&self) -> String {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}={}", i, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Thread-safe collection of [`CategoricalIndex`]es keyed by sensor name.
///
/// All appends go through one lock, so two first sightings of the same value
/// can never be given different indices.
#[derive(Debug, Default)]
pub struct CategoricalRegistry {
    indices: RwLock<HashMap<String, CategoricalIndex>>,
}

impl CategoricalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value` for `sensor`, appending it on first sight.
    pub fn index_of(&self, sensor: &str, value: &str) -> usize {
        if let Some(position) = self
            .indices
            .read()
            .get(sensor)
            .and_then(|index| index.get(value))
        {
            return position;
        }

        let mut indices = self.indices.write();
        indices.entry(sensor.to_string()).or_default().index_of(value)
    }

    /// Register declared values for `sensor`, in order.
    ///
    /// Values already known keep their index; new ones are appended.
    pub fn declare(&self, sensor: &str, values: &[String]) {
        let mut indices = self.indices.write();
        let index = indices.entry(sensor.to_string()).or_default();
        for value in values {
            index.index_of(value);
        }
    }

    /// Values known for `sensor`, ordered by index.
    pub fn legal_values(&self, sensor: &str) -> Vec<String> {
        self.indices
            .read()
            .get(sensor)
            .map(|index| index.values().to_vec())
            .unwrap_or_default()
    }

    /// Help-text legend for `sensor`, if it has a categorical index.
    pub fn legend(&self, sensor: &str) -> Option<String> {
        self.indices
            .read()
            .get(sensor)
            .filter(|index| !index.is_empty())
            .map(CategoricalIndex::legend)
    }

    pub fn contains(&self, sensor: &str) -> bool {
        self.indices.read().contains_key(sensor)
    }

    /// Number of sensors with a categorical index.
    pub fn len(&self) -> usize {
        self.indices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_index_follows_first_appearance() {
        let mut index = CategoricalIndex::default();
        assert_eq!(index.index_of("b"), 0);
        assert_eq!(index.index_of("a"), 1);
        assert_eq!(index.index_of("b"), 0);
        assert_eq!(index.index_of("c"), 2);
        assert_eq!(index.values(), ["b", "a", "c"]);
    }

    #[test]
    fn test_indices_are_stable() {
        let mut index = CategoricalIndex::with_values(["idle", "running"]);
        let sequence = ["error", "idle", "x", "running", "y", "error", "idle"];
        let mut first_seen: HashMap<&str, usize> = HashMap::new();

        for value in sequence {
            let position = index.index_of(value);
            let expected = *first_seen.entry(value).or_insert(position);
            assert_eq!(position, expected, "index of {} changed", value);
        }

        assert_eq!(index.get("idle"), Some(0));
        assert_eq!(index.get("running"), Some(1));
        assert_eq!(index.get("error"), Some(2));
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_legend() {
        let index = CategoricalIndex::with_values(["idle", "running", "error"]);
        assert_eq!(index.legend(), "0=idle, 1=running, 2=error");
    }

    #[test]
    fn test_registry_is_per_sensor() {
        let registry = CategoricalRegistry::new();
        assert_eq!(registry.index_of("a", "x"), 0);
        assert_eq!(registry.index_of("b", "y"), 0);
        assert_eq!(registry.index_of("a", "y"), 1);
        assert_eq!(registry.legal_values("a"), vec!["x", "y"]);
        assert_eq!(registry.legal_values("b"), vec!["y"]);
        assert!(registry.legal_values("c").is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_declare_then_extend() {
        let registry = CategoricalRegistry::new();
        registry.declare("mode", &["idle".to_string(), "running".to_string()]);
        assert_eq!(registry.index_of("mode", "running"), 1);
        assert_eq!(registry.index_of("mode", "error"), 2);

        // A later declaration may add values but never reorders
        registry.declare(
            "mode",
            &["running".to_string(), "idle".to_string(), "fault".to_string()],
        );
        assert_eq!(
            registry.legal_values("mode"),
            vec!["idle", "running", "error", "fault"]
        );
        assert_eq!(
            registry.legend("mode").as_deref(),
            Some("0=idle, 1=running, 2=error, 3=fault")
        );
    }

    #[test]
    fn test_declare_empty_has_no_legend() {
        let registry = CategoricalRegistry::new();
        registry.declare("mode", &[]);
        assert!(registry.contains("mode"));
        assert_eq!(registry.legend("mode"), None);
    }

    #[test]
    fn test_concurrent_first_sightings() {
        let registry = Arc::new(CategoricalRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| registry.index_of("s", &format!("v{}", i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Every thread saw the same index for the same value
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
        assert_eq!(registry.legal_values("s").len(), 50);
    }
}
