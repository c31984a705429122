use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hive_bus::EventBus;
use hive_domain::{Event, EventKind, Release};
use hive_store::Store;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::PayloadError;

/// Package-set difference between two releases.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseDiff {
    pub from: String,
    pub to: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: u32,
}

/// Drives the release state machine. Database state is authoritative;
/// filesystem mutations are best-effort and divergence is surfaced as an
/// event rather than rolled back.
#[derive(Clone)]
pub struct ReleaseManager {
    store: Store,
    bus: EventBus,
    release_dir: PathBuf,
}

impl ReleaseManager {
    pub fn new(store: Store, bus: EventBus, release_dir: PathBuf) -> Self {
        Self {
            store,
            bus,
            release_dir,
        }
    }

    /// Register a new snapshot in `staging` and create its tree.
    pub async fn create(
        &self,
        version: &str,
        name: &str,
        packages: &[String],
        now: DateTime<Utc>,
    ) -> Result<Release, PayloadError> {
        let path = self.release_dir.join(version);
        let size_bytes = dir_size(&path).await;
        let release = self.store.create_release(
            version,
            name,
            &path.display().to_string(),
            packages,
            size_bytes,
            now,
        )?;
        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            self.surface_fs_divergence(version, "create", &e);
        }
        self.emit(&release, "created");
        Ok(release)
    }

    pub fn promote(&self, version: &str, now: DateTime<Utc>) -> Result<Release, PayloadError> {
        let release = self.store.promote_release(version, now)?;
        self.emit(&release, "promoted");
        Ok(release)
    }

    pub fn archive(&self, version: &str, now: DateTime<Utc>) -> Result<Release, PayloadError> {
        let release = self.store.archive_release(version, now)?;
        self.emit(&release, "archived");
        Ok(release)
    }

    /// Promote the most recently archived release back to active.
    pub fn rollback(&self, now: DateTime<Utc>) -> Result<Option<Release>, PayloadError> {
        let release = self.store.rollback_release(now)?;
        if let Some(release) = &release {
            self.emit(release, "rolled back to");
        }
        Ok(release)
    }

    /// Delete: the row flips to `deleted` and stays; the tree goes away
    /// best-effort.
    pub async fn delete(&self, version: &str, now: DateTime<Utc>) -> Result<Release, PayloadError> {
        let release = self.store.delete_release(version, now)?;
        let path = PathBuf::from(&release.path);
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                self.surface_fs_divergence(version, "delete", &e);
            }
        }
        self.emit(&release, "deleted");
        Ok(release)
    }

    pub fn diff(&self, from: &str, to: &str) -> Result<ReleaseDiff, PayloadError> {
        for v in [from, to] {
            if self.store.get_release(v)?.is_none() {
                return Err(PayloadError::Store(
                    hive_store::StoreError::ReleaseNotFound(v.to_string()),
                ));
            }
        }
        let before: BTreeSet<String> = self.store.release_packages(from)?.into_iter().collect();
        let after: BTreeSet<String> = self.store.release_packages(to)?.into_iter().collect();
        Ok(ReleaseDiff {
            from: from.to_string(),
            to: to.to_string(),
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
            unchanged: before.intersection(&after).count() as u32,
        })
    }

    fn emit(&self, release: &Release, verb: &str) {
        info!(version = %release.version, status = %release.status, "release {}", verb);
        self.bus.publish(
            Event::new(
                EventKind::Release,
                format!("release {} {} ({})", release.version, verb, release.status),
            )
            .with_details(json!({
                "version": release.version,
                "status": release.status,
            })),
        );
    }

    fn surface_fs_divergence(&self, version: &str, op: &str, e: &std::io::Error) {
        warn!(version, op, error = %e, "release tree out of step with the database");
        self.bus.publish(
            Event::new(
                EventKind::Error,
                format!("release {} tree {} failed: {}", version, op, e),
            )
            .with_details(json!({ "version": version, "op": op })),
        );
    }
}

async fn dir_size(path: &PathBuf) -> u64 {
    let mut total = 0u64;
    let Ok(mut entries) = tokio::fs::read_dir(path).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_domain::ReleaseStatus;

    fn manager() -> (ReleaseManager, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        (
            ReleaseManager::new(store, bus.clone(), dir.path().to_path_buf()),
            bus,
            dir,
        )
    }

    #[tokio::test]
    async fn create_makes_the_tree_and_row() {
        let (manager, _bus, dir) = manager();
        let release = manager
            .create("2024.1", "january", &["a/one".to_string()], Utc::now())
            .await
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::Staging);
        assert!(dir.path().join("2024.1").is_dir());
    }

    #[tokio::test]
    async fn delete_removes_tree_but_keeps_row() {
        let (manager, _bus, dir) = manager();
        let now = Utc::now();
        manager
            .create("2024.1", "january", &[], now)
            .await
            .unwrap();
        let release = manager.delete("2024.1", now).await.unwrap();
        assert_eq!(release.status, ReleaseStatus::Deleted);
        assert!(!dir.path().join("2024.1").exists());
        assert!(manager.store.get_release("2024.1").unwrap().is_some());
    }

    #[tokio::test]
    async fn diff_reports_added_and_removed() {
        let (manager, _bus, _dir) = manager();
        let now = Utc::now();
        manager
            .create("1.0", "one", &["a/keep".into(), "a/old".into()], now)
            .await
            .unwrap();
        manager
            .create("1.1", "two", &["a/keep".into(), "a/new".into()], now)
            .await
            .unwrap();

        let diff = manager.diff("1.0", "1.1").unwrap();
        assert_eq!(diff.added, vec!["a/new".to_string()]);
        assert_eq!(diff.removed, vec!["a/old".to_string()]);
        assert_eq!(diff.unchanged, 1);
        assert!(manager.diff("1.0", "9.9").is_err());
    }
}
