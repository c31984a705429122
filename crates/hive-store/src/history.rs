use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use hive_domain::{
    epoch_to_utc, utc_to_epoch, BuildRecord, CompletionStatus, DroneId,
};

use crate::error::StoreError;
use crate::store::Store;

const HISTORY_COLS: &str = "id, ts, package, drone_id, status, duration_s, error, session_id";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BuildRecord> {
    let status: String = row.get(4)?;
    let session: Option<String> = row.get(7)?;
    Ok(BuildRecord {
        id: row.get(0)?,
        ts: epoch_to_utc(row.get(1)?),
        package: row.get(2)?,
        drone: DroneId::new(row.get::<_, String>(3)?),
        status: CompletionStatus::parse(&status).unwrap_or(CompletionStatus::Failed),
        duration_s: row.get(5)?,
        error: row.get(6)?,
        session_id: session.and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

/// Append one completed-attempt row inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_record(
    conn: &Connection,
    ts: DateTime<Utc>,
    package: &str,
    drone: &DroneId,
    status: CompletionStatus,
    duration_s: f64,
    error: Option<&str>,
    session_id: Option<Uuid>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO build_history (ts, package, drone_id, status, duration_s, error, session_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            utc_to_epoch(ts),
            package,
            drone.as_str(),
            status.to_string(),
            duration_s,
            error,
            session_id.map(|s| s.to_string())
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn list_history(
        &self,
        limit: u32,
        status: Option<CompletionStatus>,
        drone: Option<&DroneId>,
    ) -> Result<Vec<BuildRecord>, StoreError> {
        let mut sql = format!("SELECT {} FROM build_history WHERE 1=1", HISTORY_COLS);
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", values.len() + 1));
            values.push(status.to_string().into());
        }
        if let Some(drone) = drone {
            sql.push_str(&format!(" AND drone_id = ?{}", values.len() + 1));
            values.push(drone.as_str().to_string().into());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", values.len() + 1));
        values.push(i64::from(limit).into());

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(values), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Drop history rows older than `before`. The reclaim loop calls this on
    /// the retention schedule.
    pub fn prune_history(&self, before: DateTime<Utc>) -> Result<u32, StoreError> {
        let n = self.lock().execute(
            "DELETE FROM build_history WHERE ts < ?1",
            [utc_to_epoch(before)],
        )?;
        Ok(n as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn history_filters_and_prunes() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let d1 = DroneId::new("d1");
        let d2 = DroneId::new("d2");
        {
            let conn = store.lock();
            insert_record(&conn, now - Duration::days(40), "old/pkg", &d1,
                CompletionStatus::Success, 5.0, None, None).unwrap();
            insert_record(&conn, now, "new/pkg", &d1,
                CompletionStatus::Failed, 5.0, Some("err"), None).unwrap();
            insert_record(&conn, now, "new/pkg", &d2,
                CompletionStatus::Success, 5.0, None, None).unwrap();
        }

        assert_eq!(store.list_history(10, None, None).unwrap().len(), 3);
        assert_eq!(
            store
                .list_history(10, Some(CompletionStatus::Failed), None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_history(10, None, Some(&d2)).unwrap().len(), 1);

        let pruned = store.prune_history(now - Duration::days(30)).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.list_history(10, None, None).unwrap().len(), 2);
    }
}
