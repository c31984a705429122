use rusqlite::types::ValueRef;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::Store;

/// Hard cap on rows returned by the explorer.
const MAX_ROWS: usize = 500;

/// Any of these appearing as a word in the statement rejects it. Coarse on
/// purpose: the explorer is a read-only debugging surface, not a SQL console.
const FORBIDDEN: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "replace", "attach", "detach",
    "pragma", "vacuum", "reindex", "begin", "commit", "rollback", "with",
];

/// Result of a read-only explorer query.
#[derive(Debug, Serialize)]
pub struct ExplorerResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// True when the row cap cut the result short.
    pub truncated: bool,
}

/// Validate that `sql` is a single SELECT statement with no write verbs.
fn validate(sql: &str) -> Result<(), StoreError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(StoreError::RejectedQuery("empty statement".to_string()));
    }
    if trimmed.contains(';') {
        return Err(StoreError::RejectedQuery(
            "only a single statement is allowed".to_string(),
        ));
    }
    let lowered = trimmed.to_lowercase();
    if !lowered.starts_with("select") {
        return Err(StoreError::RejectedQuery(
            "only SELECT statements are allowed".to_string(),
        ));
    }
    // Word-level scan; conservative (rejects string literals containing the
    // verbs too, which is acceptable here).
    let mut word = String::new();
    for ch in lowered.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
        } else {
            if FORBIDDEN.contains(&word.as_str()) {
                return Err(StoreError::RejectedQuery(format!(
                    "forbidden verb in query: {}",
                    word
                )));
            }
            word.clear();
        }
    }
    Ok(())
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

impl Store {
    /// Table names, for the explorer's sidebar.
    pub fn explorer_tables(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    /// Column name/type pairs per table.
    pub fn explorer_schema(&self) -> Result<Value, StoreError> {
        let tables = self.explorer_tables()?;
        let conn = self.lock();
        let mut schema = serde_json::Map::new();
        for table in tables {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let cols = stmt
                .query_map([], |row| {
                    Ok(serde_json::json!({
                        "name": row.get::<_, String>(1)?,
                        "type": row.get::<_, String>(2)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            schema.insert(table, Value::Array(cols));
        }
        Ok(Value::Object(schema))
    }

    /// Run one whitelisted SELECT with a row cap. Admin-only surface.
    pub fn explorer_query(&self, sql: &str) -> Result<ExplorerResult, StoreError> {
        validate(sql)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(sql.trim().trim_end_matches(';'))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let n_cols = columns.len();

        let mut rows = Vec::new();
        let mut truncated = false;
        let mut raw = stmt.query([])?;
        while let Some(row) = raw.next()? {
            if rows.len() >= MAX_ROWS {
                truncated = true;
                break;
            }
            let mut out = Vec::with_capacity(n_cols);
            for i in 0..n_cols {
                out.push(value_to_json(row.get_ref(i)?));
            }
            rows.push(out);
        }
        Ok(ExplorerResult {
            columns,
            rows,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_works_and_maps_types() {
        let store = Store::open_in_memory().unwrap();
        store.set_flag("k", "v").unwrap();
        let result = store
            .explorer_query("SELECT key, value FROM control_flags")
            .unwrap();
        assert_eq!(result.columns, vec!["key", "value"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], Value::String("k".to_string()));
        assert!(!result.truncated);
    }

    #[test]
    fn write_verbs_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        for sql in [
            "DELETE FROM queue",
            "INSERT INTO queue (package) VALUES ('x')",
            "SELECT 1; DROP TABLE queue",
            "PRAGMA journal_mode",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "SELECT * FROM queue WHERE package = (SELECT 1); delete from queue",
            "",
        ] {
            assert!(
                matches!(store.explorer_query(sql), Err(StoreError::RejectedQuery(_))),
                "should reject: {}",
                sql
            );
        }
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.explorer_query("SELECT 1;").is_ok());
    }

    #[test]
    fn row_cap_truncates() {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.lock();
            for i in 0..600 {
                conn.execute(
                    "INSERT INTO events (ts, kind, message) VALUES (?1, 'error', 'x')",
                    [i as f64],
                )
                .unwrap();
            }
        }
        let result = store.explorer_query("SELECT id FROM events").unwrap();
        assert_eq!(result.rows.len(), 500);
        assert!(result.truncated);
    }

    #[test]
    fn tables_and_schema_list() {
        let store = Store::open_in_memory().unwrap();
        let tables = store.explorer_tables().unwrap();
        assert!(tables.contains(&"queue".to_string()));
        assert!(tables.contains(&"drones".to_string()));
        let schema = store.explorer_schema().unwrap();
        assert!(schema["queue"].as_array().unwrap().len() >= 9);
    }
}
