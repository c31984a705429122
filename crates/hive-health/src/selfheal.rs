use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use hive_bus::EventBus;
use hive_config::Settings;
use hive_domain::{Drone, DroneId, DroneKind, Event, EventKind, ProbeResult};
use hive_link::{probe_target, DroneLink, LinkTarget};
use hive_store::Store;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::HealthError;

const RESTART_CMD: &str =
    "systemctl restart hive-drone 2>/dev/null || rc-service hive-drone restart";
const KILL_RESTART_CMD: &str = "pkill -9 -x hive-drone; sleep 1; \
     systemctl restart hive-drone 2>/dev/null || rc-service hive-drone restart";
const REBOOT_CMD: &str = "nohup sh -c 'sleep 2; reboot' >/dev/null 2>&1 &";

/// Per-drone probe-failure streak; the self-healer owns all of this
/// bookkeeping, nothing else keeps parallel timers.
#[derive(Debug, Default, Clone)]
struct Streak {
    consecutive: u32,
    first_failure: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

/// The escalation ladder state machine, driven by the probe loop.
///
/// Levels: 0 healthy, 1 restart worker, 2 kill+restart, 3 reboot host
/// (containers/VMs with auto-reboot only), 4 admin alert. A level rises only
/// after the consecutive-failure and minimum-window guards are both met, and
/// each action's cooldown gates the next step. A fresh heartbeat suppresses
/// the ladder even while SSH is failing.
pub struct SelfHealer {
    store: Store,
    bus: EventBus,
    link: Arc<dyn DroneLink>,
    settings: Settings,
    streaks: Mutex<HashMap<DroneId, Streak>>,
    disk_warned: Mutex<HashSet<DroneId>>,
}

impl SelfHealer {
    pub fn new(store: Store, bus: EventBus, link: Arc<dyn DroneLink>, settings: Settings) -> Self {
        Self {
            store,
            bus,
            link,
            settings,
            streaks: Mutex::new(HashMap::new()),
            disk_warned: Mutex::new(HashSet::new()),
        }
    }

    /// Probe loop. Cadence 0 disables the monitor entirely.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let cadence = self.settings.probe_interval();
        if cadence.is_zero() {
            info!("self-healing disabled (probe interval 0)");
            return;
        }
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("self-healer stopped");
    }

    /// One pass over every registered drone. Per-drone errors never abort
    /// the sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let drones = match self.store.list_drones() {
            Ok(drones) => drones,
            Err(e) => {
                warn!(error = %e, "self-heal sweep cannot list drones");
                return;
            }
        };
        for drone in &drones {
            if let Err(e) = self.evaluate(drone, now).await {
                warn!(drone = %drone.name, error = %e, "self-heal evaluation failed");
            }
        }
    }

    /// Probe one drone and walk the ladder.
    pub async fn evaluate(&self, drone: &Drone, now: DateTime<Utc>) -> Result<(), HealthError> {
        if drone.paused {
            return Ok(());
        }
        let probe = self.ping(drone, now).await?;
        if probe.ok {
            self.handle_success(drone, &probe)?;
            return Ok(());
        }
        self.handle_failure(drone, &probe, now).await
    }

    /// On-demand probe (admin ping endpoints share this path). Records the
    /// round trip on the drone row; does not advance the ladder.
    pub async fn ping(&self, drone: &Drone, now: DateTime<Utc>) -> Result<ProbeResult, HealthError> {
        let config = self.store.get_drone_config(&drone.name)?;
        let target = LinkTarget::resolve(drone, config.as_ref());
        let probe = probe_target(
            self.link.as_ref(),
            &target,
            self.settings.ssh_connect_timeout(),
        )
        .await;
        self.store.record_drone_ping(
            &drone.id,
            now,
            probe.ok.then_some(now),
            probe.ok.then_some(probe.rtt_ms),
        )?;
        Ok(probe)
    }

    /// Admin `reset-escalation`.
    pub fn reset(&self, drone: &DroneId) -> Result<(), HealthError> {
        self.store.reset_escalation(drone)?;
        self.streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(drone);
        Ok(())
    }

    fn handle_success(&self, drone: &Drone, probe: &ProbeResult) -> Result<(), HealthError> {
        self.streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&drone.id);

        let health = self.store.get_health(&drone.id)?;
        if health.escalation_level > 0 {
            self.store.reset_escalation(&drone.id)?;
            info!(drone = %drone.name, from = health.escalation_level, "probe recovered, escalation reset");
            self.bus.publish(
                Event::new(
                    EventKind::Escalation,
                    format!("{} recovered, escalation reset", drone.name),
                )
                .with_drone(&drone.id)
                .with_details(json!({ "level": 0, "from": health.escalation_level })),
            );
        }

        // Disk pressure is surfaced once per episode and never escalates.
        let mut warned = self.disk_warned.lock().unwrap_or_else(|e| e.into_inner());
        if probe.disk_warning() {
            if warned.insert(drone.id.clone()) {
                self.bus.publish(
                    Event::new(
                        EventKind::AdminAlert,
                        format!(
                            "{} root filesystem at {}%",
                            drone.name,
                            probe.disk_percent.unwrap_or(0)
                        ),
                    )
                    .with_drone(&drone.id),
                );
            }
        } else {
            warned.remove(&drone.id);
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        drone: &Drone,
        probe: &ProbeResult,
        now: DateTime<Utc>,
    ) -> Result<(), HealthError> {
        let config = self.store.get_drone_config(&drone.name)?;

        // Decide under the streak lock, act after releasing it.
        let next = {
            let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
            let streak = streaks.entry(drone.id.clone()).or_default();
            streak.consecutive += 1;
            if streak.first_failure.is_none() {
                streak.first_failure = Some(now);
                self.bus.publish(
                    Event::new(
                        EventKind::ProbeFailure,
                        format!("probe to {} failing", drone.name),
                    )
                    .with_drone(&drone.id)
                    .with_details(json!({ "error": probe.error })),
                );
            }

            // A fresh heartbeat means the worker is alive even if SSH is not;
            // escalating here would only cause restart storms.
            let probe_window = Duration::seconds(self.settings.probe_interval_seconds as i64);
            if now - drone.last_seen <= probe_window {
                debug!(drone = %drone.name, "escalation suppressed by fresh heartbeat");
                None
            } else if streak.consecutive < self.settings.min_consecutive_failures {
                None
            } else if streak
                .first_failure
                .map_or(true, |t| now - t < Duration::seconds(self.settings.min_failure_window_seconds as i64))
            {
                None
            } else if streak.cooldown_until.map_or(false, |t| t > now) {
                None
            } else {
                Some(())
            }
        };
        if next.is_none() {
            return Ok(());
        }

        let health = self.store.get_health(&drone.id)?;
        if health.escalation_level >= 4 {
            return Ok(());
        }
        let next = health.escalation_level + 1;

        let auto_reboot = config
            .as_ref()
            .map(|c| c.auto_reboot)
            .unwrap_or(drone.capabilities.auto_reboot);
        if next == 3 && !(drone.kind.reboot_allowed() && auto_reboot) {
            // Hard stop below reboot. Level stays at 2; operators take over.
            let (kind, message) = if drone.kind == DroneKind::BareMetal {
                (
                    EventKind::BareMetalProtected,
                    format!("{} is bare-metal, refusing reboot; holding at level 2", drone.name),
                )
            } else {
                (
                    EventKind::AdminAlert,
                    format!("{} has auto-reboot disabled; holding at level 2", drone.name),
                )
            };
            warn!(drone = %drone.name, "{}", message);
            self.bus
                .publish(Event::new(kind, message).with_drone(&drone.id));
            self.set_cooldown(&drone.id, now + cooldown_for(3));
            return Ok(());
        }

        let target = LinkTarget::resolve(drone, config.as_ref());
        let action = match next {
            1 => {
                self.run_action(&target, RESTART_CMD).await;
                "restart"
            }
            2 => {
                self.run_action(&target, KILL_RESTART_CMD).await;
                "kill-restart"
            }
            3 => {
                self.run_action(&target, REBOOT_CMD).await;
                "reboot"
            }
            _ => "admin-alert",
        };

        self.store
            .set_escalation(&drone.id, next, now, next == 3)?;
        info!(drone = %drone.name, level = next, action, "escalation");
        let kind = if next == 4 {
            EventKind::AdminAlert
        } else {
            EventKind::Escalation
        };
        self.bus.publish(
            Event::new(
                kind,
                format!("{} escalated to level {} ({})", drone.name, next, action),
            )
            .with_drone(&drone.id)
            .with_details(json!({ "level": next, "action": action })),
        );
        self.set_cooldown(&drone.id, now + cooldown_for(next));
        Ok(())
    }

    async fn run_action(&self, target: &LinkTarget, command: &str) {
        match self
            .link
            .exec(target, command, self.settings.ssh_op_timeout())
            .await
        {
            Ok(output) if !output.success() => {
                warn!(%target, exit = output.exit_code, "recovery action exited non-zero");
            }
            Err(e) => warn!(%target, error = %e, "recovery action failed"),
            Ok(_) => {}
        }
    }

    fn set_cooldown(&self, drone: &DroneId, until: DateTime<Utc>) {
        if let Some(streak) = self
            .streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(drone)
        {
            streak.cooldown_until = Some(until);
        }
    }
}

fn cooldown_for(level: u8) -> Duration {
    match level {
        1 | 2 => Duration::seconds(30),
        3 => Duration::seconds(120),
        _ => Duration::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_domain::{Capabilities, DroneRole, Metrics};
    use hive_link::ScriptedLink;

    fn drone(kind: DroneKind, auto_reboot: bool, last_seen: DateTime<Utc>) -> Drone {
        Drone {
            id: DroneId::new("d1"),
            name: "alpha".into(),
            ip: "10.0.0.1".into(),
            role: DroneRole::Drone,
            kind,
            capabilities: Capabilities {
                auto_reboot,
                ..Default::default()
            },
            metrics: Metrics::default(),
            paused: false,
            current_task: None,
            version: None,
            registered_at: last_seen,
            last_seen,
            last_ping_sent: None,
            last_ping_received: None,
            last_rtt_ms: None,
        }
    }

    fn healer(link: ScriptedLink) -> (Arc<SelfHealer>, EventBus, Store) {
        let (healer, bus, store, _link) = healer_with(Arc::new(link));
        (healer, bus, store)
    }

    fn healer_with(
        link: Arc<ScriptedLink>,
    ) -> (Arc<SelfHealer>, EventBus, Store, Arc<ScriptedLink>) {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let healer = Arc::new(SelfHealer::new(
            store.clone(),
            bus.clone(),
            link.clone(),
            Settings::default(),
        ));
        (healer, bus, store, link)
    }

    fn level(store: &Store) -> u8 {
        store.get_health(&DroneId::new("d1")).unwrap().escalation_level
    }

    /// Drive the probe loop from `start`, one evaluation each 30 s, with the
    /// heartbeat pinned to `last_seen`.
    async fn drive(
        healer: &SelfHealer,
        kind: DroneKind,
        auto_reboot: bool,
        start: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        ticks: usize,
    ) {
        for k in 0..ticks {
            let now = start + Duration::seconds(30 * k as i64);
            let d = drone(kind, auto_reboot, last_seen);
            healer.evaluate(&d, now).await.unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_heartbeat_suppresses_escalation() {
        let (healer, _bus, store) = healer(ScriptedLink::unreachable());
        let start = Utc::now();
        // heartbeat always within the probe window
        for k in 0..12 {
            let now = start + Duration::seconds(30 * k as i64);
            let d = drone(DroneKind::Vm, true, now - Duration::seconds(5));
            healer.evaluate(&d, now).await.unwrap();
        }
        assert_eq!(level(&store), 0);
    }

    #[tokio::test]
    async fn ladder_rises_after_both_guards() {
        let (healer, _bus, store) = healer(ScriptedLink::unreachable());
        let start = Utc::now();
        let stale = start - Duration::seconds(120);

        // up to T+150: window under 180s, no escalation
        drive(&healer, DroneKind::Vm, true, start, stale, 6).await;
        assert_eq!(level(&store), 0);

        // T+180: both guards met, level 1
        let d = drone(DroneKind::Vm, true, stale);
        healer.evaluate(&d, start + Duration::seconds(180)).await.unwrap();
        assert_eq!(level(&store), 1);

        // T+185: inside the 30s cooldown, still level 1
        healer.evaluate(&d, start + Duration::seconds(185)).await.unwrap();
        assert_eq!(level(&store), 1);

        // T+210: cooldown over, level 2
        healer.evaluate(&d, start + Duration::seconds(210)).await.unwrap();
        assert_eq!(level(&store), 2);

        // T+240: reboot for a VM with auto-reboot
        healer.evaluate(&d, start + Duration::seconds(240)).await.unwrap();
        assert_eq!(level(&store), 3);
        assert!(store.get_health(&d.id).unwrap().reboot_flag);
    }

    #[tokio::test]
    async fn bare_metal_caps_at_two_and_alerts() {
        let (healer, bus, store) = healer(ScriptedLink::unreachable());
        let start = Utc::now();
        let stale = start - Duration::seconds(120);

        drive(&healer, DroneKind::BareMetal, true, start, stale, 7).await;
        let d = drone(DroneKind::BareMetal, true, stale);
        healer.evaluate(&d, start + Duration::seconds(210)).await.unwrap();
        assert_eq!(level(&store), 2);

        // next rung would be reboot: refused, level stays 2
        healer.evaluate(&d, start + Duration::seconds(240)).await.unwrap();
        healer.evaluate(&d, start + Duration::seconds(360)).await.unwrap();
        assert_eq!(level(&store), 2);
        assert!(!store.get_health(&d.id).unwrap().reboot_flag);
        assert!(!bus
            .recent(100, None, Some(EventKind::BareMetalProtected))
            .is_empty());
    }

    #[tokio::test]
    async fn probe_success_resets_the_ladder() {
        let (healer, _bus, store) = healer(ScriptedLink::healthy());
        let start = Utc::now();
        store
            .set_escalation(&DroneId::new("d1"), 2, start, false)
            .unwrap();
        let d = drone(DroneKind::Vm, true, start);
        healer.evaluate(&d, start).await.unwrap();
        assert_eq!(level(&store), 0);
    }

    #[tokio::test]
    async fn cadence_zero_disables_the_loop() {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let mut settings = Settings::default();
        settings.probe_interval_seconds = 0;
        let healer = Arc::new(SelfHealer::new(
            store,
            bus,
            Arc::new(ScriptedLink::unreachable()),
            settings,
        ));
        let (_tx, rx) = watch::channel(false);
        // returns immediately instead of looping
        tokio::time::timeout(std::time::Duration::from_millis(100), healer.run(rx))
            .await
            .expect("disabled monitor must return at once");
    }

    #[tokio::test]
    async fn escalation_actions_go_over_ssh() {
        let (healer, _bus, _store, link) = healer_with(Arc::new(ScriptedLink::unreachable()));
        let start = Utc::now();
        let stale = start - Duration::seconds(120);

        drive(&healer, DroneKind::Vm, true, start, stale, 7).await;
        // the restart command was attempted even though SSH keeps failing;
        // the ladder presses on to stronger measures
        assert!(link
            .calls()
            .iter()
            .any(|c| c.contains("restart hive-drone")));
    }
}
