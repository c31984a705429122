use chrono::{DateTime, Duration, Utc};
use hive_bus::EventBus;
use hive_config::Settings;
use hive_domain::{
    AssignResult, CompletionReport, CompletionResult, CompletionStatus, ControlAction, Drone,
    DroneId, Event, EventKind, QueueStatus, Registration, RejectReason,
};
use hive_health::HealthMonitor;
use hive_store::Store;
use serde_json::json;
use tracing::{debug, info};

use crate::error::SchedError;

/// Assigns queued work to eligible drones, enforces leases, accepts or drops
/// completion reports, and serves the admin control verbs.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    bus: EventBus,
    health: HealthMonitor,
    settings: Settings,
}

impl Scheduler {
    pub fn new(store: Store, bus: EventBus, health: HealthMonitor, settings: Settings) -> Self {
        Self {
            store,
            bus,
            health,
            settings,
        }
    }

    fn offline_after(&self) -> Duration {
        Duration::seconds(self.settings.reclaim_offline_minutes as i64 * 60)
    }

    /// Create-or-update a drone from its registration heartbeat.
    pub fn register(&self, reg: &Registration, now: DateTime<Utc>) -> Result<Drone, SchedError> {
        let first = self.store.get_drone(&reg.id)?.is_none();
        let drone = self.store.upsert_drone(reg, now)?;
        if first {
            info!(drone = %drone.name, ip = %drone.ip, "drone registered");
            self.bus.publish(
                Event::new(
                    EventKind::Registered,
                    format!("{} registered from {}", drone.name, drone.ip),
                )
                .with_drone(&drone.id)
                .with_details(json!({
                    "cores": drone.capabilities.cores,
                    "ram_gb": drone.capabilities.ram_gb,
                })),
            );
        }
        Ok(drone)
    }

    /// A drone pulls work. Eligibility checks first, then one atomic pick.
    pub fn request_work(
        &self,
        drone_id: &DroneId,
        now: DateTime<Utc>,
    ) -> Result<AssignResult, SchedError> {
        let Some(drone) = self.store.get_drone(drone_id)? else {
            return Ok(AssignResult::Rejected(RejectReason::UnknownDrone));
        };
        if self.store.queue_paused()? {
            return Ok(AssignResult::Rejected(RejectReason::QueuePaused));
        }
        if drone.paused {
            return Ok(AssignResult::Rejected(RejectReason::Paused));
        }
        if self.health.is_grounded(drone_id, now)? {
            return Ok(AssignResult::Rejected(RejectReason::Grounded));
        }
        if !drone.is_online(now, self.offline_after()) {
            return Ok(AssignResult::Rejected(RejectReason::Offline));
        }
        if self.store.delegated_count(drone_id)? >= self.settings.max_prefetch_per_drone {
            return Ok(AssignResult::Rejected(RejectReason::PrefetchCap));
        }

        let failure_age = Duration::seconds(self.settings.failure_age_seconds as i64);
        match self.store.assign_next(drone_id, now, failure_age)? {
            Some(item) => {
                debug!(drone = %drone.name, package = %item.package, "assigned");
                self.bus.publish(
                    Event::new(
                        EventKind::Assigned,
                        format!("{} -> {}", item.package, drone.name),
                    )
                    .with_drone(drone_id)
                    .with_package(&item.package),
                );
                Ok(AssignResult::Assigned(item))
            }
            None => Ok(AssignResult::Empty),
        }
    }

    /// Apply a completion report. Stale and already-terminal reports are
    /// dropped (the drone still gets a 200) but leave a persisted event.
    pub fn complete(
        &self,
        report: &CompletionReport,
        now: DateTime<Utc>,
    ) -> Result<CompletionResult, SchedError> {
        let failure_age = Duration::seconds(self.settings.failure_age_seconds as i64);
        let result = self.store.complete_item(report, now, failure_age)?;

        match &result {
            CompletionResult::Accepted => self.on_accepted(report, now)?,
            CompletionResult::Stale { assigned_to } => {
                info!(
                    drone = %report.drone, package = %report.package,
                    "stale completion dropped"
                );
                self.bus.publish(
                    Event::new(
                        EventKind::StaleCompletion,
                        format!(
                            "stale {} report for {} from {}",
                            report.status, report.package, report.drone
                        ),
                    )
                    .with_drone(&report.drone)
                    .with_package(&report.package)
                    .with_details(json!({
                        "assigned_to": assigned_to,
                        "reported": report.status,
                    })),
                );
            }
            CompletionResult::AlreadyTerminal | CompletionResult::UnknownPackage => {
                debug!(
                    drone = %report.drone, package = %report.package, ?result,
                    "completion ignored"
                );
                self.bus.publish(
                    Event::new(
                        EventKind::StaleCompletion,
                        format!(
                            "ignored {} report for {} ({})",
                            report.status,
                            report.package,
                            match result {
                                CompletionResult::AlreadyTerminal => "already terminal",
                                _ => "unknown package",
                            }
                        ),
                    )
                    .with_drone(&report.drone)
                    .with_package(&report.package),
                );
            }
        }
        Ok(result)
    }

    fn on_accepted(&self, report: &CompletionReport, now: DateTime<Utc>) -> Result<(), SchedError> {
        match report.status {
            CompletionStatus::Success => {
                self.health.on_build_success(&report.drone)?;
                self.bus.publish(
                    Event::new(
                        EventKind::Completed,
                        format!("{} built by {}", report.package, report.drone),
                    )
                    .with_drone(&report.drone)
                    .with_package(&report.package)
                    .with_details(json!({ "duration_s": report.duration_s })),
                );
            }
            CompletionStatus::Failed => {
                if let Some(drone) = self.store.get_drone(&report.drone)? {
                    // binhost upload trouble is a different circuit than a
                    // broken build
                    let upload = report
                        .error
                        .as_deref()
                        .map_or(false, |e| e.contains("upload") || e.contains("binhost"));
                    if upload {
                        self.health.on_upload_failure(&drone, now)?;
                    } else {
                        self.health.on_build_failure(&drone, now)?;
                    }
                }
                self.bus.publish(
                    Event::new(
                        EventKind::BuildFailed,
                        format!("{} failed on {}", report.package, report.drone),
                    )
                    .with_drone(&report.drone)
                    .with_package(&report.package)
                    .with_details(json!({ "error": report.error })),
                );
                // the completion may have tipped the item into the global block
                if let Some(item) = self.store.get_queue_item(&report.package)? {
                    if item.status == QueueStatus::Blocked {
                        self.bus.publish(
                            Event::new(
                                EventKind::Blocked,
                                format!("{} blocked after repeated failures", report.package),
                            )
                            .with_package(&report.package),
                        );
                    }
                }
            }
            CompletionStatus::Returned => {
                self.bus.publish(
                    Event::new(
                        EventKind::Returned,
                        format!("{} returned by {}", report.package, report.drone),
                    )
                    .with_drone(&report.drone)
                    .with_package(&report.package),
                );
            }
        }

        // This completion may have been the one that closed its session.
        if let Some(item) = self.store.get_queue_item(&report.package)? {
            if let Some(session_id) = item.session_id {
                if let Some(session) = self.store.get_session(session_id)? {
                    if session.status == hive_domain::SessionStatus::Completed
                        && item.status.is_terminal()
                    {
                        self.bus.publish(
                            Event::new(
                                EventKind::SessionClosed,
                                format!(
                                    "session {} closed ({}/{} built)",
                                    session.name, session.completed, session.total
                                ),
                            )
                            .with_details(json!({ "session_id": session.id })),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Admin control verbs. Returns how many rows each action touched.
    pub fn control(
        &self,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, SchedError> {
        let affected = match action {
            ControlAction::Pause => {
                self.store.set_queue_paused(true)?;
                0
            }
            ControlAction::Resume => {
                self.store.set_queue_paused(false)?;
                0
            }
            ControlAction::Unblock => self.store.unblock_packages()?,
            ControlAction::Unground => self.health.unground_all()?,
            ControlAction::Reset => self.store.reset_delegations()?,
            ControlAction::Rebalance => self.rebalance(now)?,
            ControlAction::ClearFailures => {
                self.store.clear_health_failures()?;
                self.store.clear_failure_counts()?
            }
            ControlAction::RetryFailures => self.store.retry_failed_packages()?,
        };
        info!(%action, affected, "control action");
        self.bus.publish(
            Event::new(EventKind::Control, format!("admin action: {}", action))
                .with_details(json!({ "action": action, "affected": affected })),
        );
        Ok(json!({ "action": action, "affected": affected }))
    }

    /// Let idle capacity pull queued (not yet active) work away from loaded
    /// drones. An item whose package matches the holder's current task is
    /// never taken, and a donor always keeps at least one item.
    pub fn rebalance(&self, now: DateTime<Utc>) -> Result<u32, SchedError> {
        let drones = self.store.list_drones()?;
        let offline_after = self.offline_after();
        let mut idle = 0u32;
        for drone in &drones {
            if !drone.paused
                && drone.is_online(now, offline_after)
                && !self.health.is_grounded(&drone.id, now)?
                && self.store.delegated_count(&drone.id)? == 0
            {
                idle += 1;
            }
        }
        if idle == 0 {
            return Ok(0);
        }

        let delegated = self.store.list_delegated()?;
        let mut moved = 0u32;
        for drone in &drones {
            if moved >= idle {
                break;
            }
            let held: Vec<_> = delegated
                .iter()
                .filter(|i| i.assigned_to.as_ref() == Some(&drone.id))
                .collect();
            if held.len() < 2 {
                continue;
            }
            let Some(item) = held
                .iter()
                .find(|i| drone.current_task.as_deref() != Some(i.package.as_str()))
            else {
                continue;
            };
            // keep at least one with the donor
            if self.store.reclaim_item(item.id)? {
                moved += 1;
                self.bus.publish(
                    Event::new(
                        EventKind::Rebalanced,
                        format!("{} taken back from {}", item.package, drone.name),
                    )
                    .with_drone(&drone.id)
                    .with_package(&item.package),
                );
            }
        }
        Ok(moved)
    }

    /// One reclaim pass: heartbeat-stale first, then the lease check, which
    /// only fires when the assignee answers neither heartbeat nor probe.
    pub fn reclaim_pass(&self, now: DateTime<Utc>) -> Result<u32, SchedError> {
        let offline_after = self.offline_after();
        let lease = Duration::seconds(self.settings.reclaim_lease_seconds as i64);
        let mut reclaimed = 0u32;

        for item in self.store.list_delegated()? {
            let Some(assignee) = item.assigned_to.as_ref() else {
                continue;
            };
            let drone = self.store.get_drone(assignee)?;

            let heartbeat_stale = drone
                .as_ref()
                .map_or(true, |d| !d.is_online(now, offline_after));

            let lease_expired = item
                .assigned_at
                .map_or(false, |t| now - t > lease)
                && drone.as_ref().map_or(true, |d| {
                    now - d.last_seen > lease
                        && d.last_ping_received.map_or(true, |p| now - p > lease)
                });

            if !heartbeat_stale && !lease_expired {
                continue;
            }
            if self.store.reclaim_item(item.id)? {
                reclaimed += 1;
                let reason = if heartbeat_stale { "offline" } else { "lease" };
                info!(package = %item.package, drone = %assignee, reason, "reclaimed");
                self.bus.publish(
                    Event::new(
                        EventKind::Reclaimed,
                        format!("{} reclaimed from {} ({})", item.package, assignee, reason),
                    )
                    .with_drone(assignee)
                    .with_package(&item.package)
                    .with_details(json!({ "reason": reason })),
                );
            }
        }
        Ok(reclaimed)
    }

    /// Prune build history past the retention window.
    pub fn prune_history(&self, now: DateTime<Utc>) -> Result<u32, SchedError> {
        let cutoff = now - Duration::days(self.settings.history_retention_days as i64);
        Ok(self.store.prune_history(cutoff)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_domain::{Capabilities, Metrics};

    fn reg(id: &str, name: &str) -> Registration {
        Registration {
            id: DroneId::new(id),
            name: name.into(),
            ip: "10.0.0.1".into(),
            role: Default::default(),
            capabilities: Capabilities {
                cores: 16,
                ram_gb: 64.0,
                ..Default::default()
            },
            metrics: Metrics::default(),
            current_task: None,
            version: None,
        }
    }

    fn report(drone: &str, package: &str, status: CompletionStatus) -> CompletionReport {
        CompletionReport {
            drone: DroneId::new(drone),
            package: package.into(),
            status,
            duration_s: 10.0,
            error: (status == CompletionStatus::Failed).then(|| "boom".into()),
        }
    }

    fn scheduler() -> (Scheduler, Store, EventBus) {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let settings = Settings::default();
        let health = HealthMonitor::new(store.clone(), bus.clone(), &settings);
        (
            Scheduler::new(store.clone(), bus.clone(), health, settings),
            store,
            bus,
        )
    }

    #[test]
    fn happy_path_submit_assign_complete() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();

        let session = store.create_session("t1", now).unwrap();
        store
            .submit_packages(
                &["dev-libs/openssl-3.2.0".to_string()],
                Some(session.id),
                now,
            )
            .unwrap();

        let d1 = DroneId::new("d1");
        let AssignResult::Assigned(item) = sched.request_work(&d1, now).unwrap() else {
            panic!("expected an assignment");
        };
        assert_eq!(item.package, "dev-libs/openssl-3.2.0");

        let result = sched
            .complete(&report("d1", "dev-libs/openssl-3.2.0", CompletionStatus::Success), now)
            .unwrap();
        assert_eq!(result, CompletionResult::Accepted);

        let item = store.get_queue_item("dev-libs/openssl-3.2.0").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Received);
        let history = store.list_history(10, None, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CompletionStatus::Success);
        let s = store.get_session(session.id).unwrap().unwrap();
        assert_eq!((s.total, s.completed), (1, 1));
        assert!(s.closed_at.is_some());
    }

    #[test]
    fn stale_after_rebalance_records_nothing() {
        let (sched, store, bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        sched.register(&reg("d2", "beta"), now).unwrap();
        store
            .submit_packages(&["app-misc/jq".to_string()], None, now)
            .unwrap();

        let d1 = DroneId::new("d1");
        sched.request_work(&d1, now).unwrap();
        // admin rebalance: beta is idle, alpha holds one -> donor keeps it;
        // force the move by giving alpha a second item
        store
            .submit_packages(&["app-misc/kq".to_string()], None, now)
            .unwrap();
        sched.request_work(&d1, now).unwrap();
        let moved = sched.rebalance(now).unwrap();
        assert_eq!(moved, 1);

        // the reclaimed item's late failure report is stale
        let reclaimed = store
            .list_queue(Some(QueueStatus::Needed), 10)
            .unwrap()
            .pop()
            .unwrap();
        let result = sched
            .complete(&report("d1", &reclaimed.package, CompletionStatus::Failed), now)
            .unwrap();
        assert!(matches!(result, CompletionResult::Stale { .. }));
        assert!(store.list_history(10, None, None).unwrap().is_empty());
        assert!(!bus
            .recent(100, None, Some(EventKind::StaleCompletion))
            .is_empty());
    }

    #[test]
    fn cross_drone_failures_block_and_hide_the_package() {
        let (sched, store, bus) = scheduler();
        let now = Utc::now();
        for (id, name) in [("d1", "a"), ("d2", "b"), ("d3", "c")] {
            sched.register(&reg(id, name), now).unwrap();
        }
        store
            .submit_packages(&["x11-libs/gtk".to_string()], None, now)
            .unwrap();

        sched.request_work(&DroneId::new("d1"), now).unwrap();
        sched
            .complete(&report("d1", "x11-libs/gtk", CompletionStatus::Failed), now)
            .unwrap();
        sched.request_work(&DroneId::new("d2"), now).unwrap();
        sched
            .complete(&report("d2", "x11-libs/gtk", CompletionStatus::Failed), now)
            .unwrap();

        let item = store.get_queue_item("x11-libs/gtk").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Blocked);
        assert_eq!(bus.recent(100, None, Some(EventKind::Blocked)).len(), 1);
        assert!(matches!(
            sched.request_work(&DroneId::new("d3"), now).unwrap(),
            AssignResult::Empty
        ));
    }

    #[test]
    fn rejects_paused_grounded_offline_unknown() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        store
            .submit_packages(&["a/b".to_string()], None, now)
            .unwrap();

        // unknown
        assert!(matches!(
            sched.request_work(&DroneId::new("ghost"), now).unwrap(),
            AssignResult::Rejected(RejectReason::UnknownDrone)
        ));

        // paused
        sched.register(&reg("d1", "alpha"), now).unwrap();
        store.set_drone_paused(&DroneId::new("d1"), true).unwrap();
        assert!(matches!(
            sched.request_work(&DroneId::new("d1"), now).unwrap(),
            AssignResult::Rejected(RejectReason::Paused)
        ));
        store.set_drone_paused(&DroneId::new("d1"), false).unwrap();

        // queue paused
        sched.control(ControlAction::Pause, now).unwrap();
        assert!(matches!(
            sched.request_work(&DroneId::new("d1"), now).unwrap(),
            AssignResult::Rejected(RejectReason::QueuePaused)
        ));
        sched.control(ControlAction::Resume, now).unwrap();

        // grounded
        for _ in 0..8 {
            store
                .record_build_failure(&DroneId::new("d1"), now, 8, Duration::seconds(300))
                .unwrap();
        }
        assert!(matches!(
            sched.request_work(&DroneId::new("d1"), now).unwrap(),
            AssignResult::Rejected(RejectReason::Grounded)
        ));
        sched.control(ControlAction::Unground, now).unwrap();

        // offline: registered long ago
        let later = now + Duration::minutes(20);
        assert!(matches!(
            sched.request_work(&DroneId::new("d1"), later).unwrap(),
            AssignResult::Rejected(RejectReason::Offline)
        ));
    }

    #[test]
    fn prefetch_cap_of_one_never_delegates_a_second() {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let mut settings = Settings::default();
        settings.max_prefetch_per_drone = 1;
        let health = HealthMonitor::new(store.clone(), bus.clone(), &settings);
        let sched = Scheduler::new(store.clone(), bus, health, settings);

        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        store
            .submit_packages(&["a/one".to_string(), "a/two".to_string()], None, now)
            .unwrap();

        let d1 = DroneId::new("d1");
        assert!(matches!(
            sched.request_work(&d1, now).unwrap(),
            AssignResult::Assigned(_)
        ));
        assert!(matches!(
            sched.request_work(&d1, now).unwrap(),
            AssignResult::Rejected(RejectReason::PrefetchCap)
        ));
    }

    #[test]
    fn reclaim_spares_fresh_heartbeats() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        store
            .submit_packages(&["a/one".to_string()], None, now)
            .unwrap();
        sched.request_work(&DroneId::new("d1"), now).unwrap();

        // online drone, long-held item: never reclaimed by the offline path,
        // and the lease path requires probe silence too
        let later = now + Duration::minutes(11);
        sched.register(&reg("d1", "alpha"), later).unwrap(); // heartbeat
        assert_eq!(sched.reclaim_pass(later).unwrap(), 0);
        let item = store.get_queue_item("a/one").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Delegated);
    }

    #[test]
    fn reclaim_fires_when_heartbeat_goes_stale() {
        let (sched, store, bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        store
            .submit_packages(&["a/one".to_string()], None, now)
            .unwrap();
        sched.request_work(&DroneId::new("d1"), now).unwrap();

        let later = now + Duration::minutes(16);
        assert_eq!(sched.reclaim_pass(later).unwrap(), 1);
        let item = store.get_queue_item("a/one").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Needed);
        assert_eq!(bus.recent(10, None, Some(EventKind::Reclaimed)).len(), 1);
    }

    #[test]
    fn rebalance_never_takes_the_active_build() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        sched.register(&reg("d2", "beta"), now).unwrap();
        store
            .submit_packages(&["a/one".to_string(), "a/two".to_string()], None, now)
            .unwrap();

        let d1 = DroneId::new("d1");
        sched.request_work(&d1, now).unwrap();
        sched.request_work(&d1, now).unwrap();
        // alpha is actively building a/one
        store.set_drone_current_task(&d1, Some("a/one")).unwrap();

        assert_eq!(sched.rebalance(now).unwrap(), 1);
        let one = store.get_queue_item("a/one").unwrap().unwrap();
        let two = store.get_queue_item("a/two").unwrap().unwrap();
        assert_eq!(one.status, QueueStatus::Delegated);
        assert_eq!(two.status, QueueStatus::Needed);
    }

    #[test]
    fn rebalance_without_idle_drones_moves_nothing() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "alpha"), now).unwrap();
        store
            .submit_packages(&["a/one".to_string(), "a/two".to_string()], None, now)
            .unwrap();
        let d1 = DroneId::new("d1");
        sched.request_work(&d1, now).unwrap();
        sched.request_work(&d1, now).unwrap();

        assert_eq!(sched.rebalance(now).unwrap(), 0);
    }

    #[test]
    fn control_actions_unblock_and_retry() {
        let (sched, store, _bus) = scheduler();
        let now = Utc::now();
        sched.register(&reg("d1", "a"), now).unwrap();
        sched.register(&reg("d2", "b"), now).unwrap();
        store
            .submit_packages(&["x/y".to_string()], None, now)
            .unwrap();
        sched.request_work(&DroneId::new("d1"), now).unwrap();
        sched
            .complete(&report("d1", "x/y", CompletionStatus::Failed), now)
            .unwrap();
        sched.request_work(&DroneId::new("d2"), now).unwrap();
        sched
            .complete(&report("d2", "x/y", CompletionStatus::Failed), now)
            .unwrap();
        assert_eq!(
            store.get_queue_item("x/y").unwrap().unwrap().status,
            QueueStatus::Blocked
        );

        sched.control(ControlAction::Unblock, now).unwrap();
        assert_eq!(
            store.get_queue_item("x/y").unwrap().unwrap().status,
            QueueStatus::Needed
        );
        // the unblocked package is actually schedulable again, even though
        // both drones in the fleet had failed it
        let AssignResult::Assigned(item) = sched.request_work(&DroneId::new("d1"), now).unwrap()
        else {
            panic!("expected the unblocked package to be assignable");
        };
        assert_eq!(item.package, "x/y");
    }
}
