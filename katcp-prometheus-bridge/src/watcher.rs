//! Sensor watcher: the single consumer of client events and the only writer
//! of the sensor store.

use katcp_common::{SensorType, SensorValue};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::event::{ConnectionState, SensorDeclaration, SensorEvent, SensorUpdate};
use crate::mapping::{Projection, project};
use crate::store::{Declaration, SensorDescriptor, SensorSample, SharedStore};

/// Watcher statistics.
#[derive(Debug, Clone, Default)]
pub struct WatcherStats {
    /// Sensor declarations received.
    pub declarations: u64,
    /// Declarations rejected because the sensor already has another type.
    pub type_conflicts: u64,
    /// Sensor readings received.
    pub updates: u64,
    /// Readings that updated an exposed gauge.
    pub updates_exposed: u64,
    /// Readings with no gauge (string sensors without the workaround).
    pub updates_suppressed: u64,
    /// Readings for sensors of unknown type.
    pub updates_ignored: u64,
    /// Readings whose value did not match the declared type.
    pub decode_errors: u64,
    /// `#interface-changed` notifications.
    pub interface_changes: u64,
}

/// Applies sensor events to the store, strictly in arrival order.
pub struct SensorWatcher {
    store: SharedStore,
    workaround_strings: bool,
    stats: WatcherStats,
}

impl SensorWatcher {
    pub fn new(store: SharedStore, workaround_strings: bool) -> Self {
        Self {
            store,
            workaround_strings,
            stats: WatcherStats::default(),
        }
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    /// Process events until every sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<SensorEvent>) -> WatcherStats {
        debug!("Sensor watcher started");

        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        debug!("Sensor watcher stopped");
        self.stats
    }

    pub fn handle(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Declared(declaration) => self.on_sensor_declared(declaration),
            SensorEvent::Updated(update) => self.on_sensor_update(update),
            SensorEvent::InterfaceChanged => self.on_interface_changed(),
            SensorEvent::StateChanged(state) => self.on_state_changed(state),
        }
    }

    pub fn on_sensor_declared(&mut self, declaration: SensorDeclaration) {
        self.stats.declarations += 1;

        let sensor_type = declaration.sensor_type();
        if sensor_type == SensorType::Unknown {
            debug!(
                sensor = %declaration.name,
                type_name = %declaration.type_name,
                "Unsupported sensor type, sensor will be ignored"
            );
        }

        let legal_values = if sensor_type == SensorType::Discrete {
            declaration.params
        } else {
            Vec::new()
        };
        let descriptor = SensorDescriptor::new(
            declaration.name,
            sensor_type,
            declaration.description,
            declaration.units,
        );
        let name = descriptor.name.clone();

        match self.store.declare(descriptor, &legal_values) {
            Declaration::Added => {
                info!(sensor = %name, sensor_type = %sensor_type, "Added sensor");
            }
            Declaration::Upgraded => {
                info!(sensor = %name, sensor_type = %sensor_type, "Sensor declared after first update");
            }
            Declaration::Refreshed => {
                debug!(sensor = %name, "Sensor declaration refreshed");
            }
            Declaration::Conflict { existing } => {
                self.stats.type_conflicts += 1;
                warn!(
                    sensor = %name,
                    existing = %existing,
                    declared = %sensor_type,
                    "Sensor re-declared with a different type, keeping the original"
                );
            }
        }
    }

    pub fn on_sensor_update(&mut self, update: SensorUpdate) {
        self.stats.updates += 1;

        let descriptor = self
            .store
            .descriptor(&update.name)
            .unwrap_or_else(|| self.store.declare_unknown(&update.name));

        if descriptor.sensor_type == SensorType::Unknown {
            self.stats.updates_ignored += 1;
            trace!(sensor = %update.name, "Ignoring update for sensor of unknown type");
            return;
        }

        let value = match SensorValue::decode(descriptor.sensor_type, &update.raw_value) {
            Ok(value) => value,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(sensor = %update.name, error = %e, "Dropping sensor reading");
                return;
            }
        };

        let projection = project(
            &update.name,
            &value,
            self.store.registry(),
            self.workaround_strings,
        );
        match projection {
            Projection::Gauge(v) => {
                self.stats.updates_exposed += 1;
                trace!(sensor = %update.name, value = v, status = %update.status, "Sensor updated");
            }
            Projection::Suppressed => {
                self.stats.updates_suppressed += 1;
                trace!(sensor = %update.name, "Sensor reading not exported");
            }
        }

        self.store.upsert(
            &descriptor,
            SensorSample {
                value,
                status: update.status,
                timestamp: update.timestamp,
                projection,
            },
        );
    }

    pub fn on_interface_changed(&mut self) {
        self.stats.interface_changes += 1;
        info!(
            sensors = self.store.sensor_count(),
            "Device interface changed, existing sensors are kept"
        );
    }

    pub fn on_state_changed(&mut self, state: ConnectionState) {
        let previous = self.store.set_connection_state(state);
        if previous != state {
            info!(from = %previous, to = %state, "KATCP connection state changed");
        }
    }
}
