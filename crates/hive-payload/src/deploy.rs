use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hive_bus::EventBus;
use hive_config::Settings;
use hive_domain::{
    DeployAction, DeployOutcome, Drone, Event, EventKind, PayloadKind, PayloadVersion,
};
use hive_link::{probe_target, DroneLink, LinkTarget};
use hive_store::Store;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::PayloadError;
use crate::registry::PayloadRegistry;

/// One drone's deployment attempt, as reported to the admin.
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub verified: bool,
    pub duration_s: f64,
    pub error: Option<String>,
}

/// Remote-hash verification outcome.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub matches: bool,
    pub expected: String,
    pub remote: Option<String>,
}

/// Sequential rolling deploy summary.
#[derive(Debug, Clone, Serialize)]
pub struct RollingOutcome {
    pub success_count: u32,
    pub fail_count: u32,
    pub results: BTreeMap<String, DeployResult>,
    pub rolled_back: Vec<String>,
    /// Drones skipped because the roll-out stopped early.
    pub skipped: Vec<String>,
}

/// Copies payloads onto drones over rsync and verifies them by re-hashing
/// the remote file. Every attempt leaves a deploy-log row.
#[derive(Clone)]
pub struct Deployer {
    store: Store,
    bus: EventBus,
    link: Arc<dyn DroneLink>,
    registry: PayloadRegistry,
    settings: Settings,
}

impl Deployer {
    pub fn new(
        store: Store,
        bus: EventBus,
        link: Arc<dyn DroneLink>,
        registry: PayloadRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            bus,
            link,
            registry,
            settings,
        }
    }

    fn target_for(&self, drone: &Drone) -> Result<LinkTarget, PayloadError> {
        let config = self.store.get_drone_config(&drone.name)?;
        Ok(LinkTarget::resolve(drone, config.as_ref()))
    }

    async fn remote_hash(
        &self,
        target: &LinkTarget,
        remote_path: &str,
    ) -> Result<Option<String>, PayloadError> {
        let output = self
            .link
            .exec(
                target,
                &format!("sha256sum {}", remote_path),
                self.settings.ssh_op_timeout(),
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout
            .split_whitespace()
            .next()
            .map(|s| s.to_string()))
    }

    /// Deploy one payload version to one drone, optionally verifying the
    /// remote hash afterwards.
    pub async fn deploy(
        &self,
        kind: PayloadKind,
        version: &str,
        drone_name: &str,
        verify: bool,
        now: DateTime<Utc>,
    ) -> Result<DeployResult, PayloadError> {
        let payload = self.registry.get(kind, version)?;
        let drone = self
            .store
            .get_drone_by_name(drone_name)?
            .ok_or_else(|| PayloadError::DroneNotFound(drone_name.to_string()))?;
        let result = self
            .deploy_to(&payload, &drone, verify, DeployAction::Deploy, now)
            .await?;
        Ok(result)
    }

    async fn deploy_to(
        &self,
        payload: &PayloadVersion,
        drone: &Drone,
        verify: bool,
        action: DeployAction,
        now: DateTime<Utc>,
    ) -> Result<DeployResult, PayloadError> {
        let target = self.target_for(drone)?;
        let remote_path = self.settings.payload_target(payload.kind);
        let local = self.registry.materialize(payload).await?;
        let started = Instant::now();

        let mut verified = false;
        let error: Option<String> = match self
            .link
            .copy_file(&target, &local, &remote_path, self.settings.ssh_op_timeout())
            .await
        {
            Err(e) => Some(e.to_string()),
            Ok(()) if verify => match self.remote_hash(&target, &remote_path).await {
                Ok(Some(remote)) if remote == payload.hash => {
                    verified = true;
                    None
                }
                Ok(remote) => Some(format!(
                    "hash mismatch: expected {}, remote {}",
                    payload.hash,
                    remote.as_deref().unwrap_or("unreadable")
                )),
                Err(e) => Some(format!("verify failed: {}", e)),
            },
            Ok(()) => None,
        };

        let duration_s = started.elapsed().as_secs_f64();
        let success = error.is_none();
        let status = if success {
            DeployOutcome::Success
        } else {
            DeployOutcome::Failed
        };

        self.store.append_deploy_log(
            payload.kind,
            &payload.version,
            &drone.id,
            action,
            status,
            duration_s,
            error.as_deref(),
            now,
        )?;
        self.store.set_drone_payload(
            &drone.id,
            payload.kind,
            &payload.version,
            &payload.hash,
            status,
            now,
        )?;

        if success {
            info!(drone = %drone.name, kind = %payload.kind, version = %payload.version, "payload deployed");
        } else {
            warn!(drone = %drone.name, kind = %payload.kind, version = %payload.version,
                error = error.as_deref().unwrap_or(""), "payload deploy failed");
        }
        self.bus.publish(
            Event::new(
                EventKind::PayloadDeploy,
                format!(
                    "{} {} {} on {}: {}",
                    action, payload.kind, payload.version, drone.name, status
                ),
            )
            .with_drone(&drone.id)
            .with_details(json!({
                "kind": payload.kind,
                "version": payload.version,
                "action": action,
                "status": status,
                "error": error,
            })),
        );

        Ok(DeployResult {
            success,
            verified,
            duration_s,
            error,
        })
    }

    /// Re-hash the deployed artifact on a drone against the recorded hash.
    pub async fn verify(
        &self,
        kind: PayloadKind,
        drone_name: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, PayloadError> {
        let drone = self
            .store
            .get_drone_by_name(drone_name)?
            .ok_or_else(|| PayloadError::DroneNotFound(drone_name.to_string()))?;
        let deployed = self
            .store
            .get_drone_payload(&drone.id, kind)?
            .ok_or_else(|| PayloadError::NothingDeployed {
                kind: kind.to_string(),
                drone: drone_name.to_string(),
            })?;

        let target = self.target_for(&drone)?;
        let remote = self
            .remote_hash(&target, &self.settings.payload_target(kind))
            .await?;
        let matches = remote.as_deref() == Some(deployed.hash.as_str());

        self.store.append_deploy_log(
            kind,
            &deployed.version,
            &drone.id,
            DeployAction::Verify,
            if matches {
                DeployOutcome::Success
            } else {
                DeployOutcome::Failed
            },
            0.0,
            (!matches).then(|| "remote hash mismatch".to_string()).as_deref(),
            now,
        )?;

        Ok(VerifyOutcome {
            matches,
            expected: deployed.hash,
            remote,
        })
    }

    /// Sequential roll-out: deploy (with verify) drone by drone, optionally
    /// probing health after each. The first failure stops the roll-out; with
    /// `rollback_on_fail` the failed drone — and only it — is reverted to its
    /// previously recorded version when one is known.
    pub async fn rolling(
        &self,
        kind: PayloadKind,
        version: &str,
        drones: Option<Vec<String>>,
        health_check: bool,
        rollback_on_fail: bool,
        now: DateTime<Utc>,
    ) -> Result<RollingOutcome, PayloadError> {
        let payload = self.registry.get(kind, version)?;
        let names: Vec<String> = match drones {
            Some(names) => names,
            None => self
                .store
                .list_drones()?
                .into_iter()
                .map(|d| d.name)
                .collect(),
        };

        let mut outcome = RollingOutcome {
            success_count: 0,
            fail_count: 0,
            results: BTreeMap::new(),
            rolled_back: Vec::new(),
            skipped: Vec::new(),
        };

        let mut names = names.into_iter();
        for name in names.by_ref() {
            let drone = self
                .store
                .get_drone_by_name(&name)?
                .ok_or_else(|| PayloadError::DroneNotFound(name.clone()))?;
            let previous = self.store.get_drone_payload(&drone.id, kind)?;

            let mut result = self
                .deploy_to(&payload, &drone, true, DeployAction::Deploy, now)
                .await?;

            if result.success && health_check {
                let target = self.target_for(&drone)?;
                let probe =
                    probe_target(self.link.as_ref(), &target, self.settings.ssh_connect_timeout())
                        .await;
                if !probe.ok {
                    result.success = false;
                    result.error = Some(format!(
                        "post-deploy health check failed: {}",
                        probe.error.unwrap_or_default()
                    ));
                }
            }

            let failed = !result.success;
            if failed {
                outcome.fail_count += 1;
            } else {
                outcome.success_count += 1;
            }
            outcome.results.insert(name.clone(), result);

            if failed {
                if rollback_on_fail {
                    if let Some(prev) = previous.filter(|p| p.version != payload.version) {
                        let prev_payload = self.registry.get(kind, &prev.version)?;
                        let rb = self
                            .deploy_to(&prev_payload, &drone, true, DeployAction::Rollback, now)
                            .await?;
                        if rb.success {
                            outcome.rolled_back.push(name.clone());
                        } else {
                            warn!(drone = %name, "rollback after failed deploy also failed");
                        }
                    }
                }
                break;
            }
        }
        outcome.skipped = names.collect();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_domain::{DroneId, Registration};
    use hive_link::{CommandOutput, ScriptedLink};
    use crate::registry::sha256_hex;

    struct Rig {
        deployer: Deployer,
        store: Store,
        link: Arc<ScriptedLink>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let link = Arc::new(ScriptedLink::healthy());
        let registry = PayloadRegistry::new(store.clone(), dir.path().to_path_buf());
        let deployer = Deployer::new(
            store.clone(),
            bus,
            link.clone(),
            registry,
            Settings::default(),
        );
        Rig {
            deployer,
            store,
            link,
            _dir: dir,
        }
    }

    fn add_drone(store: &Store, id: &str, name: &str) {
        let reg = Registration {
            id: DroneId::new(id),
            name: name.into(),
            ip: "10.0.0.1".into(),
            role: Default::default(),
            capabilities: Default::default(),
            metrics: Default::default(),
            current_task: None,
            version: None,
        };
        store.upsert_drone(&reg, Utc::now()).unwrap();
    }

    fn hash_reply(hash: &str) -> Result<CommandOutput, hive_link::LinkError> {
        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("{}  /usr/local/bin/hive-drone\n", hash),
            stderr: String::new(),
        })
    }

    async fn register_payload(rig: &Rig, version: &str, bytes: &[u8]) {
        rig.deployer
            .registry
            .register(PayloadKind::DroneBinary, version, bytes, None, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deploy_with_verify_success() {
        let rig = rig();
        add_drone(&rig.store, "d1", "alpha");
        register_payload(&rig, "v1", b"payload-bytes").await;
        rig.link.push_exec(hash_reply(&sha256_hex(b"payload-bytes")));

        let result = rig
            .deployer
            .deploy(PayloadKind::DroneBinary, "v1", "alpha", true, Utc::now())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.verified);

        let dp = rig
            .store
            .get_drone_payload(&DroneId::new("d1"), PayloadKind::DroneBinary)
            .unwrap()
            .unwrap();
        assert_eq!(dp.version, "v1");
        assert_eq!(dp.status, DeployOutcome::Success);
        assert_eq!(rig.store.list_deploy_log(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hash_mismatch_marks_failure() {
        let rig = rig();
        add_drone(&rig.store, "d1", "alpha");
        register_payload(&rig, "v1", b"payload-bytes").await;
        rig.link.push_exec(hash_reply("deadbeef"));

        let result = rig
            .deployer
            .deploy(PayloadKind::DroneBinary, "v1", "alpha", true, Utc::now())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("hash mismatch"));
    }

    #[tokio::test]
    async fn rolling_deploy_stops_and_rolls_back_the_failed_drone() {
        let rig = rig();
        for (id, name) in [("d1", "d1"), ("d2", "d2"), ("d3", "d3")] {
            add_drone(&rig.store, id, name);
        }
        register_payload(&rig, "v0.3.0", b"old-bytes").await;
        register_payload(&rig, "v0.4.0", b"new-bytes").await;

        // d1 already runs v0.3.0
        rig.store
            .set_drone_payload(
                &DroneId::new("d1"),
                PayloadKind::DroneBinary,
                "v0.3.0",
                &sha256_hex(b"old-bytes"),
                DeployOutcome::Success,
                Utc::now(),
            )
            .unwrap();
        // same for d2 so the rollback has somewhere to go
        rig.store
            .set_drone_payload(
                &DroneId::new("d2"),
                PayloadKind::DroneBinary,
                "v0.3.0",
                &sha256_hex(b"old-bytes"),
                DeployOutcome::Success,
                Utc::now(),
            )
            .unwrap();

        let new_hash = sha256_hex(b"new-bytes");
        let old_hash = sha256_hex(b"old-bytes");
        // d1 verify ok, d2 verify mismatches, d2 rollback verify ok
        rig.link.push_exec(hash_reply(&new_hash));
        rig.link.push_exec(hash_reply("0000"));
        rig.link.push_exec(hash_reply(&old_hash));

        let outcome = rig
            .deployer
            .rolling(
                PayloadKind::DroneBinary,
                "v0.4.0",
                Some(vec!["d1".into(), "d2".into(), "d3".into()]),
                false,
                true,
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.fail_count, 1);
        assert!(!outcome.results["d2"].success);
        assert_eq!(outcome.rolled_back, vec!["d2".to_string()]);
        assert_eq!(outcome.skipped, vec!["d3".to_string()]);
        // d3 was never touched
        assert!(rig
            .store
            .get_drone_payload(&DroneId::new("d3"), PayloadKind::DroneBinary)
            .unwrap()
            .is_none());
        // d2 is back on the old version
        let d2 = rig
            .store
            .get_drone_payload(&DroneId::new("d2"), PayloadKind::DroneBinary)
            .unwrap()
            .unwrap();
        assert_eq!(d2.version, "v0.3.0");
    }

    #[tokio::test]
    async fn verify_endpoint_compares_remote_hash() {
        let rig = rig();
        add_drone(&rig.store, "d1", "alpha");
        register_payload(&rig, "v1", b"bytes").await;
        rig.store
            .set_drone_payload(
                &DroneId::new("d1"),
                PayloadKind::DroneBinary,
                "v1",
                &sha256_hex(b"bytes"),
                DeployOutcome::Success,
                Utc::now(),
            )
            .unwrap();
        rig.link.push_exec(hash_reply(&sha256_hex(b"bytes")));

        let outcome = rig
            .deployer
            .verify(PayloadKind::DroneBinary, "alpha", Utc::now())
            .await
            .unwrap();
        assert!(outcome.matches);
    }
}
