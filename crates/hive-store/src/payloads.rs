use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hive_domain::{
    epoch_to_utc, utc_to_epoch, DeployAction, DeployLogEntry, DeployOutcome, DronePayload,
    DroneId, PayloadKind, PayloadVersion,
};

use crate::error::StoreError;
use crate::store::Store;

const PAYLOAD_COLS: &str = "kind, version, hash, size_bytes, content_path, notes, created_at";
const DRONE_PAYLOAD_COLS: &str = "drone_id, kind, version, hash, status, deployed_at, updated_at";
const DEPLOY_LOG_COLS: &str = "id, ts, kind, version, drone_id, action, status, duration_s, error";

fn payload_from_row(row: &Row<'_>) -> rusqlite::Result<PayloadVersion> {
    let kind: String = row.get(0)?;
    Ok(PayloadVersion {
        kind: PayloadKind::parse(&kind).unwrap_or(PayloadKind::Config),
        version: row.get(1)?,
        hash: row.get(2)?,
        size_bytes: row.get(3)?,
        content_path: row.get(4)?,
        notes: row.get(5)?,
        created_at: epoch_to_utc(row.get(6)?),
    })
}

fn outcome_from_str(s: &str) -> DeployOutcome {
    match s {
        "success" => DeployOutcome::Success,
        "rolled_back" => DeployOutcome::RolledBack,
        _ => DeployOutcome::Failed,
    }
}

fn drone_payload_from_row(row: &Row<'_>) -> rusqlite::Result<DronePayload> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    Ok(DronePayload {
        drone: DroneId::new(row.get::<_, String>(0)?),
        kind: PayloadKind::parse(&kind).unwrap_or(PayloadKind::Config),
        version: row.get(2)?,
        hash: row.get(3)?,
        status: outcome_from_str(&status),
        deployed_at: row.get::<_, Option<f64>>(5)?.map(epoch_to_utc),
        updated_at: epoch_to_utc(row.get(6)?),
    })
}

fn deploy_log_from_row(row: &Row<'_>) -> rusqlite::Result<DeployLogEntry> {
    let kind: String = row.get(2)?;
    let action: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(DeployLogEntry {
        id: row.get(0)?,
        ts: epoch_to_utc(row.get(1)?),
        kind: PayloadKind::parse(&kind).unwrap_or(PayloadKind::Config),
        version: row.get(3)?,
        drone: DroneId::new(row.get::<_, String>(4)?),
        action: match action.as_str() {
            "verify" => DeployAction::Verify,
            "rollback" => DeployAction::Rollback,
            _ => DeployAction::Deploy,
        },
        status: outcome_from_str(&status),
        duration_s: row.get(7)?,
        error: row.get(8)?,
    })
}

impl Store {
    /// Record a new payload version. `content` holds small payloads inline;
    /// larger ones live in a blob file at `content_path`. Duplicate
    /// `(kind, version)` is a conflict.
    #[allow(clippy::too_many_arguments)]
    pub fn register_payload(
        &self,
        kind: PayloadKind,
        version: &str,
        hash: &str,
        size_bytes: u64,
        content: Option<&[u8]>,
        content_path: Option<&str>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PayloadVersion, StoreError> {
        let inserted = self.lock().execute(
            "INSERT OR IGNORE INTO payloads (kind, version, hash, size_bytes, content, \
                 content_path, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                kind.to_string(),
                version,
                hash,
                size_bytes,
                content,
                content_path,
                notes,
                utc_to_epoch(now)
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicatePayload(
                kind.to_string(),
                version.to_string(),
            ));
        }
        self.get_payload(kind, version)?
            .ok_or_else(|| StoreError::PayloadNotFound(kind.to_string(), version.to_string()))
    }

    pub fn get_payload(
        &self,
        kind: PayloadKind,
        version: &str,
    ) -> Result<Option<PayloadVersion>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM payloads WHERE kind = ?1 AND version = ?2",
                    PAYLOAD_COLS
                ),
                params![kind.to_string(), version],
                payload_from_row,
            )
            .optional()?)
    }

    /// Inline payload bytes, when the payload was stored inline.
    pub fn get_payload_content(
        &self,
        kind: PayloadKind,
        version: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                "SELECT content FROM payloads WHERE kind = ?1 AND version = ?2",
                params![kind.to_string(), version],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn list_payloads(&self) -> Result<Vec<PayloadVersion>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payloads ORDER BY kind, created_at DESC",
            PAYLOAD_COLS
        ))?;
        let payloads = stmt
            .query_map([], payload_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payloads)
    }

    pub fn list_payload_versions(
        &self,
        kind: PayloadKind,
    ) -> Result<Vec<PayloadVersion>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payloads WHERE kind = ?1 ORDER BY created_at DESC",
            PAYLOAD_COLS
        ))?;
        let payloads = stmt
            .query_map([kind.to_string()], payload_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payloads)
    }

    /// Upsert the per-drone deployment state for one payload kind.
    pub fn set_drone_payload(
        &self,
        drone: &DroneId,
        kind: PayloadKind,
        version: &str,
        hash: &str,
        status: DeployOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let deployed_at = (status == DeployOutcome::Success).then(|| utc_to_epoch(now));
        self.lock().execute(
            "INSERT INTO drone_payloads (drone_id, kind, version, hash, status, deployed_at, \
                 updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(drone_id, kind) DO UPDATE SET
                 version = excluded.version,
                 hash = excluded.hash,
                 status = excluded.status,
                 deployed_at = COALESCE(excluded.deployed_at, drone_payloads.deployed_at),
                 updated_at = excluded.updated_at",
            params![
                drone.as_str(),
                kind.to_string(),
                version,
                hash,
                status.to_string(),
                deployed_at,
                utc_to_epoch(now)
            ],
        )?;
        Ok(())
    }

    pub fn get_drone_payload(
        &self,
        drone: &DroneId,
        kind: PayloadKind,
    ) -> Result<Option<DronePayload>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM drone_payloads WHERE drone_id = ?1 AND kind = ?2",
                    DRONE_PAYLOAD_COLS
                ),
                params![drone.as_str(), kind.to_string()],
                drone_payload_from_row,
            )
            .optional()?)
    }

    pub fn list_drone_payloads(&self) -> Result<Vec<DronePayload>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM drone_payloads ORDER BY drone_id, kind",
            DRONE_PAYLOAD_COLS
        ))?;
        let rows = stmt
            .query_map([], drone_payload_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append one deployment-attempt record.
    #[allow(clippy::too_many_arguments)]
    pub fn append_deploy_log(
        &self,
        kind: PayloadKind,
        version: &str,
        drone: &DroneId,
        action: DeployAction,
        status: DeployOutcome,
        duration_s: f64,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO deploy_log (ts, kind, version, drone_id, action, status, duration_s, \
                 error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                utc_to_epoch(now),
                kind.to_string(),
                version,
                drone.as_str(),
                action.to_string(),
                status.to_string(),
                duration_s,
                error
            ],
        )?;
        Ok(())
    }

    pub fn list_deploy_log(&self, limit: u32) -> Result<Vec<DeployLogEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deploy_log ORDER BY id DESC LIMIT ?1",
            DEPLOY_LOG_COLS
        ))?;
        let rows = stmt
            .query_map([limit], deploy_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_kind_version_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .register_payload(
                PayloadKind::DroneBinary,
                "v0.4.0",
                "abc123",
                4,
                Some(b"ELF\x7f"),
                None,
                None,
                now,
            )
            .unwrap();
        let err = store
            .register_payload(
                PayloadKind::DroneBinary,
                "v0.4.0",
                "def456",
                4,
                None,
                None,
                None,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePayload(..)));
    }

    #[test]
    fn inline_content_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store
            .register_payload(
                PayloadKind::Config,
                "1",
                "h",
                5,
                Some(b"hello"),
                None,
                Some("first config"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(
            store
                .get_payload_content(PayloadKind::Config, "1")
                .unwrap()
                .as_deref(),
            Some(&b"hello"[..])
        );
        assert!(store
            .get_payload_content(PayloadKind::Config, "2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn drone_payload_state_upserts() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");
        store
            .set_drone_payload(&d1, PayloadKind::DroneBinary, "v1", "h1", DeployOutcome::Success, now)
            .unwrap();
        store
            .set_drone_payload(&d1, PayloadKind::DroneBinary, "v2", "h2", DeployOutcome::Failed, now)
            .unwrap();

        let dp = store
            .get_drone_payload(&d1, PayloadKind::DroneBinary)
            .unwrap()
            .unwrap();
        assert_eq!(dp.version, "v2");
        assert_eq!(dp.status, DeployOutcome::Failed);
        // deployed_at survives from the last success
        assert!(dp.deployed_at.is_some());
        assert_eq!(store.list_drone_payloads().unwrap().len(), 1);
    }
}
