use rusqlite::Row;

use hive_domain::{epoch_to_utc, utc_to_epoch, DroneId, ProtocolEntry};

use crate::error::StoreError;
use crate::store::Store;

const PROTOCOL_COLS: &str = "ts, source, method, path, tag, status, latency_ms, drone_id, \
     package, request_body, response_body";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ProtocolEntry> {
    Ok(ProtocolEntry {
        ts: epoch_to_utc(row.get(0)?),
        source: row.get(1)?,
        method: row.get(2)?,
        path: row.get(3)?,
        tag: row.get(4)?,
        status: row.get(5)?,
        latency_ms: row.get(6)?,
        drone: row.get::<_, Option<String>>(7)?.map(DroneId::new),
        package: row.get(8)?,
        request_body: row.get(9)?,
        response_body: row.get(10)?,
    })
}

impl Store {
    /// Persist a batch of protocol entries in one commit. Called only by the
    /// protocol recorder's background worker.
    pub fn append_protocol_entries(&self, entries: &[ProtocolEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO protocol_log (ts, source, method, path, tag, status, latency_ms, \
                     drone_id, package, request_body, response_body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for entry in entries {
                stmt.execute(rusqlite::params![
                    utc_to_epoch(entry.ts),
                    entry.source,
                    entry.method,
                    entry.path,
                    entry.tag,
                    entry.status,
                    entry.latency_ms,
                    entry.drone.as_ref().map(|d| d.as_str().to_string()),
                    entry.package,
                    entry.request_body,
                    entry.response_body,
                ])?;
            }
            Ok(())
        })
    }

    pub fn list_protocol_entries(&self, limit: u32) -> Result<Vec<ProtocolEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM protocol_log ORDER BY id DESC LIMIT ?1",
            PROTOCOL_COLS
        ))?;
        let entries = stmt
            .query_map([limit], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
