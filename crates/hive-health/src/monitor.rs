use chrono::{DateTime, Duration, Utc};
use hive_bus::EventBus;
use hive_config::Settings;
use hive_domain::{Drone, DroneId, Event, EventKind, HealthRecord};
use hive_store::Store;
use serde_json::json;
use tracing::info;

use crate::error::HealthError;

/// Per-drone failure counters and the grounding circuit breaker.
///
/// Build failures accumulate until the ceiling (per-drone override from the
/// admin config, else the global default) grounds the drone for a cooldown.
/// Successes decay the counter; upload failures track separately.
#[derive(Clone)]
pub struct HealthMonitor {
    store: Store,
    bus: EventBus,
    default_ceiling: u32,
    cooldown: Duration,
}

impl HealthMonitor {
    pub fn new(store: Store, bus: EventBus, settings: &Settings) -> Self {
        Self {
            store,
            bus,
            default_ceiling: settings.max_failures,
            cooldown: Duration::seconds(settings.grounding_timeout_seconds as i64),
        }
    }

    fn ceiling_for(&self, drone: &Drone) -> Result<u32, HealthError> {
        Ok(self
            .store
            .get_drone_config(&drone.name)?
            .and_then(|c| c.max_failures)
            .unwrap_or(self.default_ceiling))
    }

    /// Count a build failure; returns the updated record. Emits a `grounded`
    /// event when the breaker trips.
    pub fn on_build_failure(
        &self,
        drone: &Drone,
        now: DateTime<Utc>,
    ) -> Result<HealthRecord, HealthError> {
        let ceiling = self.ceiling_for(drone)?;
        let before = self.store.get_health(&drone.id)?;
        let record = self
            .store
            .record_build_failure(&drone.id, now, ceiling, self.cooldown)?;
        if record.is_grounded(now) && !before.is_grounded(now) {
            info!(drone = %drone.name, failures = record.failures, "drone grounded");
            self.bus.publish(
                Event::new(
                    EventKind::Grounded,
                    format!("{} grounded after {} failures", drone.name, record.failures),
                )
                .with_drone(&drone.id)
                .with_details(json!({
                    "failures": record.failures,
                    "until": record.grounded_until,
                })),
            );
        }
        Ok(record)
    }

    pub fn on_build_success(&self, drone: &DroneId) -> Result<(), HealthError> {
        self.store.record_build_success(drone)?;
        Ok(())
    }

    /// Upload failures have their own counter but share the breaker.
    pub fn on_upload_failure(
        &self,
        drone: &Drone,
        now: DateTime<Utc>,
    ) -> Result<HealthRecord, HealthError> {
        let ceiling = self.ceiling_for(drone)?;
        let before = self.store.get_health(&drone.id)?;
        let record = self
            .store
            .record_upload_failure(&drone.id, now, ceiling, self.cooldown)?;
        if record.is_grounded(now) && !before.is_grounded(now) {
            self.bus.publish(
                Event::new(
                    EventKind::Grounded,
                    format!("{} grounded after upload failures", drone.name),
                )
                .with_drone(&drone.id),
            );
        }
        Ok(record)
    }

    pub fn is_grounded(&self, drone: &DroneId, now: DateTime<Utc>) -> Result<bool, HealthError> {
        Ok(self.store.get_health(drone)?.is_grounded(now))
    }

    /// Admin `unground`: lift every breaker. Returns how many were lifted.
    pub fn unground_all(&self) -> Result<u32, HealthError> {
        let lifted = self.store.unground_all()?;
        if lifted > 0 {
            self.bus.publish(Event::new(
                EventKind::Ungrounded,
                format!("{} drone(s) ungrounded by admin", lifted),
            ));
        }
        Ok(lifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_domain::{Capabilities, DroneConfig, DroneKind, DroneRole, Metrics};

    fn drone(id: &str, name: &str) -> Drone {
        Drone {
            id: DroneId::new(id),
            name: name.into(),
            ip: "10.0.0.1".into(),
            role: DroneRole::Drone,
            kind: DroneKind::Vm,
            capabilities: Capabilities::default(),
            metrics: Metrics::default(),
            paused: false,
            current_task: None,
            version: None,
            registered_at: Utc::now(),
            last_seen: Utc::now(),
            last_ping_sent: None,
            last_ping_received: None,
            last_rtt_ms: None,
        }
    }

    fn monitor() -> (HealthMonitor, EventBus) {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let settings = Settings::default();
        (HealthMonitor::new(store, bus.clone(), &settings), bus)
    }

    #[test]
    fn grounds_at_default_ceiling_and_emits_once() {
        let (monitor, bus) = monitor();
        let d = drone("d1", "alpha");
        let now = Utc::now();
        for _ in 0..8 {
            monitor.on_build_failure(&d, now).unwrap();
        }
        assert!(monitor.is_grounded(&d.id, now).unwrap());
        let grounded: Vec<_> = bus.recent(50, None, Some(EventKind::Grounded));
        assert_eq!(grounded.len(), 1);
    }

    #[test]
    fn per_drone_ceiling_override_applies() {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let monitor = HealthMonitor::new(store.clone(), bus, &Settings::default());
        let mut cfg = DroneConfig::new("alpha");
        cfg.max_failures = Some(2);
        store.upsert_drone_config(&cfg).unwrap();

        let d = drone("d1", "alpha");
        let now = Utc::now();
        monitor.on_build_failure(&d, now).unwrap();
        assert!(!monitor.is_grounded(&d.id, now).unwrap());
        monitor.on_build_failure(&d, now).unwrap();
        assert!(monitor.is_grounded(&d.id, now).unwrap());
    }

    #[test]
    fn unground_lifts_the_breaker() {
        let (monitor, _bus) = monitor();
        let d = drone("d1", "alpha");
        let now = Utc::now();
        for _ in 0..8 {
            monitor.on_build_failure(&d, now).unwrap();
        }
        assert_eq!(monitor.unground_all().unwrap(), 1);
        assert!(!monitor.is_grounded(&d.id, now).unwrap());
    }
}
