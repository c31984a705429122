use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hive_domain::{epoch_to_utc, utc_to_epoch, DroneId, HealthRecord};

use crate::error::StoreError;
use crate::store::Store;

const HEALTH_COLS: &str = "drone_id, failures, last_failure, reboot_flag, grounded_until, \
     upload_failures, escalation_level, last_escalation, escalation_attempts";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HealthRecord> {
    Ok(HealthRecord {
        drone: DroneId::new(row.get::<_, String>(0)?),
        failures: row.get(1)?,
        last_failure: row.get::<_, Option<f64>>(2)?.map(epoch_to_utc),
        reboot_flag: row.get(3)?,
        grounded_until: row.get::<_, Option<f64>>(4)?.map(epoch_to_utc),
        upload_failures: row.get(5)?,
        escalation_level: row.get(6)?,
        last_escalation: row.get::<_, Option<f64>>(7)?.map(epoch_to_utc),
        escalation_attempts: row.get(8)?,
    })
}

impl Store {
    /// The drone's health record, defaulted when none has been written yet.
    pub fn get_health(&self, drone: &DroneId) -> Result<HealthRecord, StoreError> {
        let record = self
            .lock()
            .query_row(
                &format!("SELECT {} FROM health WHERE drone_id = ?1", HEALTH_COLS),
                [drone.as_str()],
                record_from_row,
            )
            .optional()?;
        Ok(record.unwrap_or_else(|| HealthRecord::new(drone.clone())))
    }

    pub fn list_health(&self) -> Result<Vec<HealthRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM health ORDER BY drone_id", HEALTH_COLS))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count one build failure; ground the drone when the ceiling is crossed.
    /// Returns the updated record (callers emit the grounding event).
    pub fn record_build_failure(
        &self,
        drone: &DroneId,
        now: DateTime<Utc>,
        ceiling: u32,
        cooldown: Duration,
    ) -> Result<HealthRecord, StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO health (drone_id, failures, last_failure) VALUES (?1, 1, ?2)
                 ON CONFLICT(drone_id) DO UPDATE SET
                     failures = health.failures + 1,
                     last_failure = excluded.last_failure",
                params![drone.as_str(), utc_to_epoch(now)],
            )?;
            let failures: u32 = tx.query_row(
                "SELECT failures FROM health WHERE drone_id = ?1",
                [drone.as_str()],
                |row| row.get(0),
            )?;
            if failures >= ceiling {
                tx.execute(
                    "UPDATE health SET grounded_until = ?2 WHERE drone_id = ?1",
                    params![drone.as_str(), utc_to_epoch(now + cooldown)],
                )?;
            }
            tx.query_row(
                &format!("SELECT {} FROM health WHERE drone_id = ?1", HEALTH_COLS),
                [drone.as_str()],
                record_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    /// Successful completions decay the failure counter by one.
    pub fn record_build_success(&self, drone: &DroneId) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE health SET failures = MAX(failures - 1, 0) WHERE drone_id = ?1",
            [drone.as_str()],
        )?;
        Ok(())
    }

    /// Upload failures count separately from build failures.
    pub fn record_upload_failure(
        &self,
        drone: &DroneId,
        now: DateTime<Utc>,
        ceiling: u32,
        cooldown: Duration,
    ) -> Result<HealthRecord, StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO health (drone_id, upload_failures, last_failure) VALUES (?1, 1, ?2)
                 ON CONFLICT(drone_id) DO UPDATE SET
                     upload_failures = health.upload_failures + 1,
                     last_failure = excluded.last_failure",
                params![drone.as_str(), utc_to_epoch(now)],
            )?;
            let uploads: u32 = tx.query_row(
                "SELECT upload_failures FROM health WHERE drone_id = ?1",
                [drone.as_str()],
                |row| row.get(0),
            )?;
            if uploads >= ceiling {
                tx.execute(
                    "UPDATE health SET grounded_until = ?2 WHERE drone_id = ?1",
                    params![drone.as_str(), utc_to_epoch(now + cooldown)],
                )?;
            }
            tx.query_row(
                &format!("SELECT {} FROM health WHERE drone_id = ?1", HEALTH_COLS),
                [drone.as_str()],
                record_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    /// Lift the circuit breaker (admin `unground`). Counters reset too so the
    /// drone does not instantly re-ground on its next failure.
    pub fn unground_all(&self) -> Result<u32, StoreError> {
        let n = self.lock().execute(
            "UPDATE health SET grounded_until = NULL, failures = 0, upload_failures = 0
             WHERE grounded_until IS NOT NULL",
            [],
        )?;
        Ok(n as u32)
    }

    pub fn clear_health_failures(&self) -> Result<u32, StoreError> {
        let n = self
            .lock()
            .execute("UPDATE health SET failures = 0, upload_failures = 0", [])?;
        Ok(n as u32)
    }

    /// Record a ladder step: level, timestamp, attempt count, reboot flag.
    pub fn set_escalation(
        &self,
        drone: &DroneId,
        level: u8,
        now: DateTime<Utc>,
        rebooted: bool,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO health (drone_id, escalation_level, last_escalation, \
                 escalation_attempts, reboot_flag)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(drone_id) DO UPDATE SET
                 escalation_level = excluded.escalation_level,
                 last_escalation = excluded.last_escalation,
                 escalation_attempts = health.escalation_attempts + 1,
                 reboot_flag = health.reboot_flag OR excluded.reboot_flag",
            params![drone.as_str(), level, utc_to_epoch(now), rebooted],
        )?;
        Ok(())
    }

    /// Ladder back to level 0 (successful probe or admin reset).
    pub fn reset_escalation(&self, drone: &DroneId) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE health SET escalation_level = 0, escalation_attempts = 0, reboot_flag = 0
             WHERE drone_id = ?1",
            [drone.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_ground_at_ceiling_and_success_decays() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");
        let cooldown = Duration::seconds(300);

        for _ in 0..7 {
            let rec = store.record_build_failure(&d1, now, 8, cooldown).unwrap();
            assert!(!rec.is_grounded(now));
        }
        let rec = store.record_build_failure(&d1, now, 8, cooldown).unwrap();
        assert!(rec.is_grounded(now));
        assert!(!rec.is_grounded(now + Duration::seconds(301)));

        store.record_build_success(&d1).unwrap();
        assert_eq!(store.get_health(&d1).unwrap().failures, 7);
    }

    #[test]
    fn upload_failures_track_separately() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");
        store
            .record_upload_failure(&d1, now, 8, Duration::seconds(300))
            .unwrap();
        let rec = store.get_health(&d1).unwrap();
        assert_eq!(rec.upload_failures, 1);
        assert_eq!(rec.failures, 0);
    }

    #[test]
    fn unground_resets_counters() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");
        for _ in 0..8 {
            store
                .record_build_failure(&d1, now, 8, Duration::seconds(300))
                .unwrap();
        }
        assert!(store.get_health(&d1).unwrap().is_grounded(now));
        assert_eq!(store.unground_all().unwrap(), 1);
        let rec = store.get_health(&d1).unwrap();
        assert!(!rec.is_grounded(now));
        assert_eq!(rec.failures, 0);
    }

    #[test]
    fn escalation_bookkeeping() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");

        store.set_escalation(&d1, 1, now, false).unwrap();
        store.set_escalation(&d1, 2, now, false).unwrap();
        store.set_escalation(&d1, 3, now, true).unwrap();
        let rec = store.get_health(&d1).unwrap();
        assert_eq!(rec.escalation_level, 3);
        assert_eq!(rec.escalation_attempts, 3);
        assert!(rec.reboot_flag);

        store.reset_escalation(&d1).unwrap();
        let rec = store.get_health(&d1).unwrap();
        assert_eq!(rec.escalation_level, 0);
        assert!(!rec.reboot_flag);
    }
}
