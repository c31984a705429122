use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use hive_domain::{epoch_to_utc, utc_to_epoch, Session, SessionStatus};

use crate::error::StoreError;
use crate::store::Store;

const SESSION_COLS: &str = "id, name, status, total, completed, failed, created_at, closed_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(Session {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        status: match status.as_str() {
            "completed" => SessionStatus::Completed,
            "aborted" => SessionStatus::Aborted,
            _ => SessionStatus::Active,
        },
        total: row.get(3)?,
        completed: row.get(4)?,
        failed: row.get(5)?,
        created_at: epoch_to_utc(row.get(6)?),
        closed_at: row.get::<_, Option<f64>>(7)?.map(epoch_to_utc),
    })
}

/// Recompute a session's totals from its queue rows and close it once every
/// member item is terminal. Runs inside the caller's transaction.
pub(crate) fn rollup(
    conn: &Connection,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let sid = session_id.to_string();
    let (total, completed, failed, open): (u32, u32, u32, u32) = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN status = 'received' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status IN ('blocked', 'failed') THEN 1 ELSE 0 END),
                SUM(CASE WHEN status IN ('needed', 'delegated') THEN 1 ELSE 0 END)
         FROM queue WHERE session_id = ?1",
        [&sid],
        |row| {
            Ok((
                row.get(0)?,
                row.get::<_, Option<u32>>(1)?.unwrap_or(0),
                row.get::<_, Option<u32>>(2)?.unwrap_or(0),
                row.get::<_, Option<u32>>(3)?.unwrap_or(0),
            ))
        },
    )?;

    if total > 0 && open == 0 {
        conn.execute(
            "UPDATE sessions SET total = ?2, completed = ?3, failed = ?4,
                 status = 'completed', closed_at = ?5
             WHERE id = ?1 AND status = 'active'",
            params![sid, total, completed, failed, utc_to_epoch(now)],
        )?;
        // totals still refresh if the session was already closed
        conn.execute(
            "UPDATE sessions SET total = ?2, completed = ?3, failed = ?4 WHERE id = ?1",
            params![sid, total, completed, failed],
        )?;
    } else {
        conn.execute(
            "UPDATE sessions SET total = ?2, completed = ?3, failed = ?4 WHERE id = ?1",
            params![sid, total, completed, failed],
        )?;
    }
    Ok(())
}

impl Store {
    pub fn create_session(&self, name: &str, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let session = Session {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: SessionStatus::Active,
            total: 0,
            completed: 0,
            failed: 0,
            created_at: now,
            closed_at: None,
        };
        self.lock().execute(
            "INSERT INTO sessions (id, name, status, created_at) VALUES (?1, ?2, 'active', ?3)",
            params![session.id.to_string(), session.name, utc_to_epoch(now)],
        )?;
        Ok(session)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLS),
                [id.to_string()],
                session_from_row,
            )
            .optional()?)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Recompute one session's totals outside a completion (admin actions).
    pub fn refresh_session(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.transaction(|tx| rollup(tx, id, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hive_domain::{CompletionReport, CompletionStatus, DroneId, Registration};

    #[test]
    fn session_rolls_up_and_closes() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let reg = Registration {
            id: DroneId::new("d1"),
            name: "alpha".into(),
            ip: "10.0.0.1".into(),
            role: Default::default(),
            capabilities: Default::default(),
            metrics: Default::default(),
            current_task: None,
            version: None,
        };
        store.upsert_drone(&reg, now).unwrap();

        let session = store.create_session("t1", now).unwrap();
        store
            .submit_packages(
                &["dev-libs/openssl-3.2.0".to_string()],
                Some(session.id),
                now,
            )
            .unwrap();

        let d1 = DroneId::new("d1");
        store
            .assign_next(&d1, now, Duration::seconds(1800))
            .unwrap()
            .unwrap();
        store
            .complete_item(
                &CompletionReport {
                    drone: d1,
                    package: "dev-libs/openssl-3.2.0".into(),
                    status: CompletionStatus::Success,
                    duration_s: 10.0,
                    error: None,
                },
                now,
                Duration::seconds(1800),
            )
            .unwrap();

        let s = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(s.total, 1);
        assert_eq!(s.completed, 1);
        assert_eq!(s.failed, 0);
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.closed_at.is_some());
    }

    #[test]
    fn open_items_keep_the_session_active() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let session = store.create_session("t2", now).unwrap();
        store
            .submit_packages(
                &["a/one".to_string(), "a/two".to_string()],
                Some(session.id),
                now,
            )
            .unwrap();
        store.refresh_session(session.id, now).unwrap();

        let s = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.closed_at.is_none());
    }
}
