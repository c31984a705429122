use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use hive_domain::{epoch_to_utc, utc_to_epoch, Release, ReleaseStatus};

use crate::error::StoreError;
use crate::store::Store;

const RELEASE_COLS: &str =
    "version, name, status, package_count, size_bytes, path, created_at, updated_at";

fn release_from_row(row: &Row<'_>) -> rusqlite::Result<Release> {
    let status: String = row.get(2)?;
    Ok(Release {
        version: row.get(0)?,
        name: row.get(1)?,
        status: ReleaseStatus::parse(&status).unwrap_or_default(),
        package_count: row.get(3)?,
        size_bytes: row.get(4)?,
        path: row.get(5)?,
        created_at: epoch_to_utc(row.get(6)?),
        updated_at: epoch_to_utc(row.get(7)?),
    })
}

fn get(conn: &Connection, version: &str) -> Result<Option<Release>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM releases WHERE version = ?1", RELEASE_COLS),
            [version],
            release_from_row,
        )
        .optional()?)
}

fn set_status(
    conn: &Connection,
    version: &str,
    status: ReleaseStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE releases SET status = ?2, updated_at = ?3 WHERE version = ?1",
        params![version, status.to_string(), utc_to_epoch(now)],
    )?;
    Ok(())
}

impl Store {
    /// Register a new release snapshot in `staging`.
    pub fn create_release(
        &self,
        version: &str,
        name: &str,
        path: &str,
        packages: &[String],
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<Release, StoreError> {
        self.transaction(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO releases (version, name, status, package_count, \
                     size_bytes, path, created_at, updated_at)
                 VALUES (?1, ?2, 'staging', ?3, ?4, ?5, ?6, ?6)",
                params![
                    version,
                    name,
                    packages.len() as u32,
                    size_bytes,
                    path,
                    utc_to_epoch(now)
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::InvalidReleaseTransition {
                    from: "existing".to_string(),
                    to: "staging".to_string(),
                });
            }
            for package in packages {
                tx.execute(
                    "INSERT OR IGNORE INTO release_packages (version, package) VALUES (?1, ?2)",
                    params![version, package],
                )?;
            }
            get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))
        })
    }

    pub fn get_release(&self, version: &str) -> Result<Option<Release>, StoreError> {
        get(&self.lock(), version)
    }

    pub fn list_releases(&self) -> Result<Vec<Release>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM releases ORDER BY created_at DESC",
            RELEASE_COLS
        ))?;
        let releases = stmt
            .query_map([], release_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(releases)
    }

    pub fn active_release(&self) -> Result<Option<Release>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM releases WHERE status = 'active' LIMIT 1",
                    RELEASE_COLS
                ),
                [],
                release_from_row,
            )
            .optional()?)
    }

    /// Promote to `active`, archiving the incumbent in the same commit.
    /// Promoting the already-active release is a no-op.
    pub fn promote_release(&self, version: &str, now: DateTime<Utc>) -> Result<Release, StoreError> {
        self.transaction(|tx| {
            let release =
                get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))?;
            if release.status == ReleaseStatus::Active {
                return Ok(release);
            }
            if !release.status.can_transition_to(ReleaseStatus::Active) {
                return Err(StoreError::InvalidReleaseTransition {
                    from: release.status.to_string(),
                    to: ReleaseStatus::Active.to_string(),
                });
            }
            tx.execute(
                "UPDATE releases SET status = 'archived', updated_at = ?1 WHERE status = 'active'",
                [utc_to_epoch(now)],
            )?;
            set_status(tx, version, ReleaseStatus::Active, now)?;
            get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))
        })
    }

    /// Archive the given active release. Archiving the only active release
    /// leaves zero active.
    pub fn archive_release(&self, version: &str, now: DateTime<Utc>) -> Result<Release, StoreError> {
        self.transaction(|tx| {
            let release =
                get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))?;
            if !release.status.can_transition_to(ReleaseStatus::Archived) {
                return Err(StoreError::InvalidReleaseTransition {
                    from: release.status.to_string(),
                    to: ReleaseStatus::Archived.to_string(),
                });
            }
            set_status(tx, version, ReleaseStatus::Archived, now)?;
            get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))
        })
    }

    /// Promote the most recently archived release (rollback). Returns it.
    pub fn rollback_release(&self, now: DateTime<Utc>) -> Result<Option<Release>, StoreError> {
        let previous = self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM releases WHERE status = 'archived'
                     ORDER BY updated_at DESC LIMIT 1",
                    RELEASE_COLS
                ),
                [],
                release_from_row,
            )
            .optional()?;
        match previous {
            Some(release) => Ok(Some(self.promote_release(&release.version, now)?)),
            None => Ok(None),
        }
    }

    /// Mark a release `deleted`. The row is retained; removing the filesystem
    /// tree is the caller's (best-effort) concern.
    pub fn delete_release(&self, version: &str, now: DateTime<Utc>) -> Result<Release, StoreError> {
        self.transaction(|tx| {
            let release =
                get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))?;
            if !release.status.can_transition_to(ReleaseStatus::Deleted) {
                return Err(StoreError::InvalidReleaseTransition {
                    from: release.status.to_string(),
                    to: ReleaseStatus::Deleted.to_string(),
                });
            }
            set_status(tx, version, ReleaseStatus::Deleted, now)?;
            get(tx, version)?.ok_or_else(|| StoreError::ReleaseNotFound(version.to_string()))
        })
    }

    pub fn release_packages(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT package FROM release_packages WHERE version = ?1 ORDER BY package",
        )?;
        let packages = stmt
            .query_map([version], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packages)
    }
}
