use std::sync::Arc;

use chrono::{DateTime, Utc};
use hive_bus::{EventBus, ProtocolRecorder};
use hive_config::Settings;
use hive_health::{HealthMonitor, SelfHealer};
use hive_link::DroneLink;
use hive_payload::{Deployer, PayloadRegistry, ReleaseManager};
use hive_sched::Scheduler;
use hive_store::Store;

/// Everything the handlers need, bound once at start-up and injected.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: EventBus,
    pub recorder: ProtocolRecorder,
    pub scheduler: Scheduler,
    pub health: HealthMonitor,
    pub healer: Arc<SelfHealer>,
    pub link: Arc<dyn DroneLink>,
    pub registry: PayloadRegistry,
    pub deployer: Deployer,
    pub releases: ReleaseManager,
    pub settings: Arc<Settings>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the full component set over one store and bus.
    pub fn build(
        store: Store,
        bus: EventBus,
        recorder: ProtocolRecorder,
        link: Arc<dyn DroneLink>,
        settings: Settings,
    ) -> Self {
        let health = HealthMonitor::new(store.clone(), bus.clone(), &settings);
        let scheduler = Scheduler::new(store.clone(), bus.clone(), health.clone(), settings.clone());
        let healer = Arc::new(SelfHealer::new(
            store.clone(),
            bus.clone(),
            link.clone(),
            settings.clone(),
        ));
        let registry = PayloadRegistry::new(store.clone(), settings.payload_dir.clone());
        let deployer = Deployer::new(
            store.clone(),
            bus.clone(),
            link.clone(),
            registry.clone(),
            settings.clone(),
        );
        let releases = ReleaseManager::new(store.clone(), bus.clone(), settings.release_dir.clone());
        Self {
            store,
            bus,
            recorder,
            scheduler,
            health,
            healer,
            link,
            registry,
            deployer,
            releases,
            settings: Arc::new(settings),
            started_at: Utc::now(),
        }
    }
}
