use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hive_domain::{
    epoch_to_utc, utc_to_epoch, Capabilities, Drone, DroneId, DroneKind, DroneRole, Metrics,
    Registration,
};

use crate::error::StoreError;
use crate::store::Store;

const DRONE_COLS: &str = "id, name, ip, role, kind, cores, ram_gb, arch, tags, auto_reboot, \
     portage_timestamp, cpu_percent, ram_percent, load_1m, paused, current_task, version, \
     registered_at, last_seen, last_ping_sent, last_ping_received, last_rtt_ms";

pub(crate) fn drone_from_row(row: &Row<'_>) -> rusqlite::Result<Drone> {
    let role: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let tags: String = row.get(8)?;
    Ok(Drone {
        id: DroneId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        ip: row.get(2)?,
        role: if role == "sweeper" {
            DroneRole::Sweeper
        } else {
            DroneRole::Drone
        },
        kind: DroneKind::parse(&kind).unwrap_or_default(),
        capabilities: Capabilities {
            cores: row.get(5)?,
            ram_gb: row.get(6)?,
            arch: row.get(7)?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            auto_reboot: row.get(9)?,
            portage_timestamp: row.get(10)?,
        },
        metrics: Metrics {
            cpu_percent: row.get(11)?,
            ram_percent: row.get(12)?,
            load_1m: row.get(13)?,
        },
        paused: row.get(14)?,
        current_task: row.get(15)?,
        version: row.get(16)?,
        registered_at: epoch_to_utc(row.get(17)?),
        last_seen: epoch_to_utc(row.get(18)?),
        last_ping_sent: row.get::<_, Option<f64>>(19)?.map(epoch_to_utc),
        last_ping_received: row.get::<_, Option<f64>>(20)?.map(epoch_to_utc),
        last_rtt_ms: row.get(21)?,
    })
}

impl Store {
    /// Create-or-update from a registration heartbeat. Idempotent on id;
    /// admin-owned fields (kind, paused) survive untouched.
    pub fn upsert_drone(&self, reg: &Registration, now: DateTime<Utc>) -> Result<Drone, StoreError> {
        let tags = serde_json::to_string(&reg.capabilities.tags)?;
        self.lock().execute(
            "INSERT INTO drones (id, name, ip, role, cores, ram_gb, arch, tags, auto_reboot, \
                 portage_timestamp, cpu_percent, ram_percent, load_1m, current_task, version, \
                 registered_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 ip = excluded.ip,
                 role = excluded.role,
                 cores = excluded.cores,
                 ram_gb = excluded.ram_gb,
                 arch = excluded.arch,
                 tags = excluded.tags,
                 auto_reboot = excluded.auto_reboot,
                 portage_timestamp = excluded.portage_timestamp,
                 cpu_percent = excluded.cpu_percent,
                 ram_percent = excluded.ram_percent,
                 load_1m = excluded.load_1m,
                 current_task = excluded.current_task,
                 version = excluded.version,
                 last_seen = excluded.last_seen",
            params![
                reg.id.as_str(),
                reg.name,
                reg.ip,
                reg.role.to_string(),
                reg.capabilities.cores,
                reg.capabilities.ram_gb,
                reg.capabilities.arch,
                tags,
                reg.capabilities.auto_reboot,
                reg.capabilities.portage_timestamp,
                reg.metrics.cpu_percent,
                reg.metrics.ram_percent,
                reg.metrics.load_1m,
                reg.current_task,
                reg.version,
                utc_to_epoch(now),
            ],
        )?;
        self.get_drone(&reg.id)?
            .ok_or_else(|| StoreError::DroneNotFound(reg.id.to_string()))
    }

    pub fn get_drone(&self, id: &DroneId) -> Result<Option<Drone>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {} FROM drones WHERE id = ?1", DRONE_COLS),
                [id.as_str()],
                drone_from_row,
            )
            .optional()?)
    }

    pub fn get_drone_by_name(&self, name: &str) -> Result<Option<Drone>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {} FROM drones WHERE name = ?1", DRONE_COLS),
                [name],
                drone_from_row,
            )
            .optional()?)
    }

    pub fn list_drones(&self) -> Result<Vec<Drone>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM drones ORDER BY name", DRONE_COLS))?;
        let drones = stmt
            .query_map([], drone_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(drones)
    }

    pub fn set_drone_paused(&self, id: &DroneId, paused: bool) -> Result<(), StoreError> {
        let n = self.lock().execute(
            "UPDATE drones SET paused = ?2 WHERE id = ?1",
            params![id.as_str(), paused],
        )?;
        if n == 0 {
            return Err(StoreError::DroneNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_drone_kind(&self, id: &DroneId, kind: DroneKind) -> Result<(), StoreError> {
        let n = self.lock().execute(
            "UPDATE drones SET kind = ?2 WHERE id = ?1",
            params![id.as_str(), kind.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::DroneNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_drone_current_task(
        &self,
        id: &DroneId,
        task: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE drones SET current_task = ?2 WHERE id = ?1",
            params![id.as_str(), task],
        )?;
        Ok(())
    }

    /// Record an on-demand ping round trip on the drone row.
    pub fn record_drone_ping(
        &self,
        id: &DroneId,
        sent: DateTime<Utc>,
        received: Option<DateTime<Utc>>,
        rtt_ms: Option<f64>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE drones SET last_ping_sent = ?2, last_ping_received = ?3, last_rtt_ms = ?4
             WHERE id = ?1",
            params![
                id.as_str(),
                utc_to_epoch(sent),
                received.map(utc_to_epoch),
                rtt_ms
            ],
        )?;
        Ok(())
    }

    pub fn delete_drone(&self, id: &DroneId) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM drones WHERE id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM health WHERE drone_id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, name: &str) -> Registration {
        Registration {
            id: DroneId::new(id),
            name: name.to_string(),
            ip: "10.0.0.1".to_string(),
            role: DroneRole::Drone,
            capabilities: Capabilities {
                cores: 16,
                ram_gb: 64.0,
                tags: vec!["amd64".to_string()],
                ..Default::default()
            },
            metrics: Metrics::default(),
            current_task: None,
            version: Some("0.4.0".to_string()),
        }
    }

    #[test]
    fn register_twice_is_one_row_with_fresh_last_seen() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store.upsert_drone(&reg("d1", "alpha"), t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        store.upsert_drone(&reg("d1", "alpha"), t1).unwrap();

        let all = store.list_drones().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_seen.timestamp(), t1.timestamp());
        assert_eq!(all[0].capabilities.tags, vec!["amd64"]);
    }

    #[test]
    fn kind_and_pause_survive_reregistration() {
        let store = Store::open_in_memory().unwrap();
        let id = DroneId::new("d1");
        store.upsert_drone(&reg("d1", "alpha"), Utc::now()).unwrap();
        store.set_drone_kind(&id, DroneKind::BareMetal).unwrap();
        store.set_drone_paused(&id, true).unwrap();

        store.upsert_drone(&reg("d1", "alpha"), Utc::now()).unwrap();
        let d = store.get_drone(&id).unwrap().unwrap();
        assert_eq!(d.kind, DroneKind::BareMetal);
        assert!(d.paused);
    }

    #[test]
    fn unknown_drone_updates_error() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.set_drone_paused(&DroneId::new("ghost"), true),
            Err(StoreError::DroneNotFound(_))
        ));
    }

    #[test]
    fn lookup_by_name() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_drone(&reg("d1", "alpha"), Utc::now()).unwrap();
        assert!(store.get_drone_by_name("alpha").unwrap().is_some());
        assert!(store.get_drone_by_name("beta").unwrap().is_none());
    }
}
