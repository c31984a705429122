use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use hive_domain::{
    epoch_to_utc, utc_to_epoch, CompletionReport, CompletionResult, CompletionStatus, DroneId,
    QueueItem, QueueStatus,
};

use crate::error::StoreError;
use crate::history;
use crate::sessions;
use crate::store::Store;

/// A package that keeps failing is blocked outright once it burns this many
/// attempts, even when all of them landed on the same drone.
const PACKAGE_FAILURE_CAP: u32 = 4;

pub(crate) const QUEUE_COLS: &str =
    "id, package, status, assigned_to, assigned_at, completed_at, failure_count, last_error, \
     session_id, created_at";

pub(crate) fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let status: String = row.get(2)?;
    let session: Option<String> = row.get(8)?;
    Ok(QueueItem {
        id: row.get(0)?,
        package: row.get(1)?,
        status: QueueStatus::parse(&status).unwrap_or_default(),
        assigned_to: row.get::<_, Option<String>>(3)?.map(DroneId::new),
        assigned_at: row.get::<_, Option<f64>>(4)?.map(epoch_to_utc),
        completed_at: row.get::<_, Option<f64>>(5)?.map(epoch_to_utc),
        failure_count: row.get(6)?,
        last_error: row.get(7)?,
        session_id: session.and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: epoch_to_utc(row.get(9)?),
    })
}

/// Per-status queue totals for the status endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    pub needed: u32,
    pub delegated: u32,
    pub received: u32,
    pub blocked: u32,
    pub failed: u32,
}

fn latest_for_package(
    conn: &Connection,
    package: &str,
) -> Result<Option<QueueItem>, StoreError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM queue WHERE package = ?1 ORDER BY id DESC LIMIT 1",
                QUEUE_COLS
            ),
            [package],
            item_from_row,
        )
        .optional()?)
}

impl Store {
    /// Enqueue `packages`, skipping any that already have an active (needed or
    /// delegated) row. Returns how many rows were created.
    pub fn submit_packages(
        &self,
        packages: &[String],
        session_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.transaction(|tx| {
            let mut created = 0;
            for package in packages {
                let active: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM queue WHERE package = ?1 AND status IN ('needed', 'delegated')",
                    [package],
                    |row| row.get(0),
                )?;
                if active > 0 {
                    continue;
                }
                tx.execute(
                    "INSERT INTO queue (package, status, session_id, created_at)
                     VALUES (?1, 'needed', ?2, ?3)",
                    params![
                        package,
                        session_id.map(|s| s.to_string()),
                        utc_to_epoch(now)
                    ],
                )?;
                created += 1;
            }
            Ok(created)
        })
    }

    /// Pick and delegate the next item for `drone` per the assignment rules:
    /// skip packages whose latest attempt by this drone failed (a later
    /// success clears the streak), skip globally blocked packages (≥2
    /// distinct failing drones within `failure_age`), prefer packages
    /// another drone attempted and lost, FIFO otherwise.
    ///
    /// Eligibility of the drone itself (paused, grounded, offline, prefetch
    /// cap) is the scheduler's concern.
    pub fn assign_next(
        &self,
        drone: &DroneId,
        now: DateTime<Utc>,
        failure_age: Duration,
    ) -> Result<Option<QueueItem>, StoreError> {
        let window_start = utc_to_epoch(now - failure_age);
        self.transaction(|tx| {
            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM queue q
                         WHERE q.status = 'needed'
                           AND COALESCE((
                               SELECT h.status FROM build_history h
                               WHERE h.package = q.package AND h.drone_id = ?1
                               ORDER BY h.id DESC LIMIT 1), '') != 'failed'
                           AND (SELECT COUNT(DISTINCT h2.drone_id) FROM build_history h2
                                WHERE h2.package = q.package AND h2.status = 'failed'
                                  AND h2.ts >= ?2) < 2
                         ORDER BY
                           EXISTS (
                               SELECT 1 FROM build_history h3
                               WHERE h3.package = q.package AND h3.drone_id != ?1
                                 AND h3.status IN ('failed', 'returned')) DESC,
                           q.id ASC
                         LIMIT 1",
                        QUEUE_COLS
                    ),
                    params![drone.as_str(), window_start],
                    item_from_row,
                )
                .optional()?;

            let Some(mut item) = candidate else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE queue SET status = 'delegated', assigned_to = ?2, assigned_at = ?3
                 WHERE id = ?1 AND status = 'needed'",
                params![item.id, drone.as_str(), utc_to_epoch(now)],
            )?;
            item.status = QueueStatus::Delegated;
            item.assigned_to = Some(drone.clone());
            item.assigned_at = Some(now);
            Ok(Some(item))
        })
    }

    /// How many items `drone` currently holds in `delegated`.
    pub fn delegated_count(&self, drone: &DroneId) -> Result<u32, StoreError> {
        Ok(self.lock().query_row(
            "SELECT COUNT(*) FROM queue WHERE status = 'delegated' AND assigned_to = ?1",
            [drone.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Apply a completion report. The acceptance check (reporter must be the
    /// current assignee of a live `delegated` row) happens inside the same
    /// transaction as the state transition, the history append, the drone's
    /// current-task update and the session rollup.
    pub fn complete_item(
        &self,
        report: &CompletionReport,
        now: DateTime<Utc>,
        failure_age: Duration,
    ) -> Result<CompletionResult, StoreError> {
        let window_start = utc_to_epoch(now - failure_age);
        self.transaction(|tx| {
            let Some(item) = latest_for_package(tx, &report.package)? else {
                return Ok(CompletionResult::UnknownPackage);
            };
            if item.status.is_terminal() {
                return Ok(CompletionResult::AlreadyTerminal);
            }
            if item.status != QueueStatus::Delegated
                || item.assigned_to.as_ref() != Some(&report.drone)
            {
                return Ok(CompletionResult::Stale {
                    assigned_to: item.assigned_to.clone(),
                });
            }

            match report.status {
                CompletionStatus::Success => {
                    // The success row appended below becomes the latest
                    // attempt for this (package, drone) pair, clearing its
                    // failure streak for future assignment.
                    tx.execute(
                        "UPDATE queue SET status = 'received', completed_at = ?2 WHERE id = ?1",
                        params![item.id, utc_to_epoch(now)],
                    )?;
                }
                CompletionStatus::Failed => {
                    // Count this failure before deciding on a global block.
                    history::insert_record(
                        tx,
                        now,
                        &report.package,
                        &report.drone,
                        CompletionStatus::Failed,
                        report.duration_s,
                        report.error.as_deref(),
                        item.session_id,
                    )?;
                    let distinct: u32 = tx.query_row(
                        "SELECT COUNT(DISTINCT drone_id) FROM build_history
                         WHERE package = ?1 AND status = 'failed' AND ts >= ?2",
                        params![report.package, window_start],
                        |row| row.get(0),
                    )?;
                    let failures = item.failure_count + 1;
                    if distinct >= 2 || failures >= PACKAGE_FAILURE_CAP {
                        tx.execute(
                            "UPDATE queue SET status = 'blocked', assigned_to = NULL,
                                 assigned_at = NULL, completed_at = ?2, failure_count = ?3,
                                 last_error = ?4
                             WHERE id = ?1",
                            params![item.id, utc_to_epoch(now), failures, report.error],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE queue SET status = 'needed', assigned_to = NULL,
                                 assigned_at = NULL, failure_count = ?2, last_error = ?3
                             WHERE id = ?1",
                            params![item.id, failures, report.error],
                        )?;
                    }
                }
                CompletionStatus::Returned => {
                    tx.execute(
                        "UPDATE queue SET status = 'needed', assigned_to = NULL,
                             assigned_at = NULL
                         WHERE id = ?1",
                        params![item.id],
                    )?;
                }
            }

            // Success and returned attempts are logged too; the failed path
            // already wrote its row so the block count included it.
            if report.status != CompletionStatus::Failed {
                history::insert_record(
                    tx,
                    now,
                    &report.package,
                    &report.drone,
                    report.status,
                    report.duration_s,
                    report.error.as_deref(),
                    item.session_id,
                )?;
            }

            tx.execute(
                "UPDATE drones SET current_task = NULL
                 WHERE id = ?1 AND current_task = ?2",
                params![report.drone.as_str(), report.package],
            )?;

            if let Some(session_id) = item.session_id {
                sessions::rollup(tx, session_id, now)?;
            }

            Ok(CompletionResult::Accepted)
        })
    }

    /// All items currently in `delegated`, oldest assignment first.
    pub fn list_delegated(&self) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue WHERE status = 'delegated' ORDER BY assigned_at",
            QUEUE_COLS
        ))?;
        let items = stmt
            .query_map([], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Return a delegated item to `needed` (reclaim, rebalance, admin reset).
    /// No-op when the item has moved on; returns whether anything changed.
    pub fn reclaim_item(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.lock().execute(
            "UPDATE queue SET status = 'needed', assigned_to = NULL, assigned_at = NULL
             WHERE id = ?1 AND status = 'delegated'",
            [id],
        )?;
        Ok(n > 0)
    }

    /// Admin `reset`: every delegated item back to `needed`.
    pub fn reset_delegations(&self) -> Result<u32, StoreError> {
        let n = self.lock().execute(
            "UPDATE queue SET status = 'needed', assigned_to = NULL, assigned_at = NULL
             WHERE status = 'delegated'",
            [],
        )?;
        Ok(n as u32)
    }

    /// Admin `unblock`: blocked items become schedulable again. The failure
    /// rows that triggered the block are dropped in the same commit; without
    /// that, every drone that ever failed the package would still be
    /// excluded and the flip back to `needed` would assign nothing.
    pub fn unblock_packages(&self) -> Result<u32, StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "DELETE FROM build_history WHERE status = 'failed' AND package IN
                     (SELECT package FROM queue WHERE status = 'blocked')",
                [],
            )?;
            let n = tx.execute(
                "UPDATE queue SET status = 'needed', completed_at = NULL
                 WHERE status = 'blocked'",
                [],
            )?;
            Ok(n as u32)
        })
    }

    /// Admin `retry_failures`: failed items become schedulable again, with
    /// their failure memory cleared the same way `unblock` does it.
    pub fn retry_failed_packages(&self) -> Result<u32, StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "DELETE FROM build_history WHERE status = 'failed' AND package IN
                     (SELECT package FROM queue WHERE status = 'failed')",
                [],
            )?;
            let n = tx.execute(
                "UPDATE queue SET status = 'needed', completed_at = NULL
                 WHERE status = 'failed'",
                [],
            )?;
            Ok(n as u32)
        })
    }

    /// Admin `clear_failures`: zero the per-item failure counters.
    pub fn clear_failure_counts(&self) -> Result<u32, StoreError> {
        let n = self.lock().execute(
            "UPDATE queue SET failure_count = 0, last_error = NULL
             WHERE status NOT IN ('received')",
            [],
        )?;
        Ok(n as u32)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
        let mut counts = QueueCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "needed" => counts.needed = n,
                "delegated" => counts.delegated = n,
                "received" => counts.received = n,
                "blocked" => counts.blocked = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub fn list_queue(
        &self,
        status: Option<QueueStatus>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.lock();
        let items = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                    QUEUE_COLS
                ))?;
                let rows = stmt.query_map(params![status.to_string(), limit], item_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue ORDER BY id DESC LIMIT ?1",
                    QUEUE_COLS
                ))?;
                let rows = stmt.query_map([limit], item_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(items)
    }

    pub fn get_queue_item(&self, package: &str) -> Result<Option<QueueItem>, StoreError> {
        latest_for_package(&self.lock(), package)
    }
}
