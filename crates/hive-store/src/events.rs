use chrono::{DateTime, Utc};
use rusqlite::Row;

use hive_domain::{epoch_to_utc, utc_to_epoch, DroneId, Event, EventKind};

use crate::error::StoreError;
use crate::store::Store;

const EVENT_COLS: &str = "ts, kind, message, details, drone_id, package";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get(1)?;
    let details: Option<String> = row.get(3)?;
    Ok(Event {
        ts: epoch_to_utc(row.get(0)?),
        kind: EventKind::parse(&kind).unwrap_or(EventKind::Error),
        message: row.get(2)?,
        details: details
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or(serde_json::Value::Null),
        drone: row.get::<_, Option<String>>(4)?.map(DroneId::new),
        package: row.get(5)?,
    })
}

impl Store {
    /// Persist a batch of events in one commit. Called by the event bus
    /// write-behind task, never from the request path.
    pub fn append_events(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        self.transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO events (ts, kind, message, details, drone_id, package)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                let details = if event.details.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&event.details)?)
                };
                stmt.execute(rusqlite::params![
                    utc_to_epoch(event.ts),
                    event.kind.to_string(),
                    event.message,
                    details,
                    event.drone.as_ref().map(|d| d.as_str().to_string()),
                    event.package,
                ])?;
            }
            Ok(())
        })
    }

    pub fn list_events(
        &self,
        limit: u32,
        since: Option<DateTime<Utc>>,
        kind: Option<EventKind>,
        drone: Option<&DroneId>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut sql = format!("SELECT {} FROM events WHERE 1=1", EVENT_COLS);
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(since) = since {
            sql.push_str(&format!(" AND ts > ?{}", values.len() + 1));
            values.push(utc_to_epoch(since).into());
        }
        if let Some(kind) = kind {
            sql.push_str(&format!(" AND kind = ?{}", values.len() + 1));
            values.push(kind.to_string().into());
        }
        if let Some(drone) = drone {
            sql.push_str(&format!(" AND drone_id = ?{}", values.len() + 1));
            values.push(drone.as_str().to_string().into());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", values.len() + 1));
        values.push(i64::from(limit).into());

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(rusqlite::params_from_iter(values), event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
