use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Schema applied to fresh databases. Older databases are brought up to date
/// by [`ensure_column`] calls below; migrations only ever add.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS drones (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    ip                TEXT NOT NULL,
    role              TEXT NOT NULL DEFAULT 'drone',
    kind              TEXT NOT NULL DEFAULT 'unknown',
    cores             INTEGER NOT NULL DEFAULT 0,
    ram_gb            REAL NOT NULL DEFAULT 0,
    arch              TEXT,
    tags              TEXT NOT NULL DEFAULT '[]',
    auto_reboot       INTEGER NOT NULL DEFAULT 0,
    portage_timestamp TEXT,
    cpu_percent       REAL NOT NULL DEFAULT 0,
    ram_percent       REAL NOT NULL DEFAULT 0,
    load_1m           REAL NOT NULL DEFAULT 0,
    paused            INTEGER NOT NULL DEFAULT 0,
    current_task      TEXT,
    version           TEXT,
    registered_at     REAL NOT NULL,
    last_seen         REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS queue (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    package       TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'needed',
    assigned_to   TEXT,
    assigned_at   REAL,
    completed_at  REAL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    created_at    REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_status ON queue (status);
CREATE INDEX IF NOT EXISTS idx_queue_package ON queue (package);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'active',
    total      INTEGER NOT NULL DEFAULT 0,
    completed  INTEGER NOT NULL DEFAULT 0,
    failed     INTEGER NOT NULL DEFAULT 0,
    created_at REAL NOT NULL,
    closed_at  REAL
);

CREATE TABLE IF NOT EXISTS health (
    drone_id            TEXT PRIMARY KEY,
    failures            INTEGER NOT NULL DEFAULT 0,
    last_failure        REAL,
    reboot_flag         INTEGER NOT NULL DEFAULT 0,
    grounded_until      REAL,
    escalation_level    INTEGER NOT NULL DEFAULT 0,
    last_escalation     REAL,
    escalation_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    ts       REAL NOT NULL,
    kind     TEXT NOT NULL,
    message  TEXT NOT NULL,
    details  TEXT,
    drone_id TEXT,
    package  TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events (kind);

CREATE TABLE IF NOT EXISTS protocol_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts            REAL NOT NULL,
    source        TEXT NOT NULL,
    method        TEXT NOT NULL,
    path          TEXT NOT NULL,
    tag           TEXT NOT NULL,
    status        INTEGER NOT NULL,
    latency_ms    REAL NOT NULL,
    drone_id      TEXT,
    package       TEXT,
    request_body  TEXT NOT NULL DEFAULT '',
    response_body TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_protocol_ts ON protocol_log (ts);

CREATE TABLE IF NOT EXISTS build_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts         REAL NOT NULL,
    package    TEXT NOT NULL,
    drone_id   TEXT NOT NULL,
    status     TEXT NOT NULL,
    duration_s REAL NOT NULL DEFAULT 0,
    error      TEXT,
    session_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_history_package ON build_history (package, status, ts);
CREATE INDEX IF NOT EXISTS idx_history_drone ON build_history (drone_id);

CREATE TABLE IF NOT EXISTS payloads (
    kind         TEXT NOT NULL,
    version      TEXT NOT NULL,
    hash         TEXT NOT NULL,
    size_bytes   INTEGER NOT NULL,
    content      BLOB,
    content_path TEXT,
    notes        TEXT,
    created_at   REAL NOT NULL,
    PRIMARY KEY (kind, version)
);

CREATE TABLE IF NOT EXISTS drone_payloads (
    drone_id    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    version     TEXT NOT NULL,
    hash        TEXT NOT NULL,
    status      TEXT NOT NULL,
    deployed_at REAL,
    updated_at  REAL NOT NULL,
    PRIMARY KEY (drone_id, kind)
);

CREATE TABLE IF NOT EXISTS deploy_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts         REAL NOT NULL,
    kind       TEXT NOT NULL,
    version    TEXT NOT NULL,
    drone_id   TEXT NOT NULL,
    action     TEXT NOT NULL,
    status     TEXT NOT NULL,
    duration_s REAL NOT NULL DEFAULT 0,
    error      TEXT
);

CREATE TABLE IF NOT EXISTS releases (
    version       TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'staging',
    package_count INTEGER NOT NULL DEFAULT 0,
    size_bytes    INTEGER NOT NULL DEFAULT 0,
    path          TEXT NOT NULL,
    created_at    REAL NOT NULL,
    updated_at    REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS release_packages (
    version TEXT NOT NULL,
    package TEXT NOT NULL,
    PRIMARY KEY (version, package)
);

CREATE TABLE IF NOT EXISTS drone_config (
    name           TEXT PRIMARY KEY,
    ssh_user       TEXT,
    ssh_port       INTEGER,
    ssh_key_path   TEXT,
    ssh_password   TEXT,
    core_limit     INTEGER,
    job_count      INTEGER,
    mem_cap_gb     REAL,
    auto_reboot    INTEGER NOT NULL DEFAULT 0,
    protected      INTEGER NOT NULL DEFAULT 0,
    max_failures   INTEGER,
    binhost_target TEXT,
    display_name   TEXT,
    control_tag    TEXT,
    locked         INTEGER NOT NULL DEFAULT 0,
    notes          TEXT
);

CREATE TABLE IF NOT EXISTS control_flags (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// The one durable state store: a single SQLite file in WAL mode.
///
/// Writes serialize behind the connection mutex; readers ride along on the
/// same handle. All multi-entity invariants are enforced inside single
/// transactions via [`Store::transaction`].
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    ///
    /// Parent directories are created automatically; the schema and any
    /// missing columns are applied idempotently.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("create state dir: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        migrate(&conn)?;
        debug!("store open at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-write; the
        // transaction it held has rolled back, so the connection is usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside one transaction. A failed commit is retried once with
    /// the closure re-run from scratch, then surfaced.
    pub fn transaction<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        match tx.commit() {
            Ok(()) => Ok(value),
            Err(e) => {
                warn!(error = %e, "store commit failed; retrying once");
                let tx = conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            }
        }
    }

    // ── Control flags ────────────────────────────────────────────────────────

    pub fn set_flag(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO control_flags (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn get_flag(&self, key: &str) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        Ok(self
            .lock()
            .query_row(
                "SELECT value FROM control_flags WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn queue_paused(&self) -> Result<bool, StoreError> {
        Ok(self.get_flag("queue_paused")?.as_deref() == Some("1"))
    }

    pub fn set_queue_paused(&self, paused: bool) -> Result<(), StoreError> {
        self.set_flag("queue_paused", if paused { "1" } else { "0" })
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;

    // Columns that postdate the first shipped schema. Adding is the only
    // migration the store ever performs.
    ensure_column(conn, "drones", "last_ping_sent", "REAL")?;
    ensure_column(conn, "drones", "last_ping_received", "REAL")?;
    ensure_column(conn, "drones", "last_rtt_ms", "REAL")?;
    ensure_column(conn, "queue", "session_id", "TEXT")?;
    ensure_column(conn, "health", "upload_failures", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

/// Add `column` to `table` when absent. No-op otherwise.
fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    if !existing.iter().any(|c| c == column) {
        debug!("migrating: adding {}.{}", table, column);
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, decl
        ))?;
    }
    Ok(())
}
