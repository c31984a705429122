use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hive_domain::{PayloadKind, PayloadVersion};
use hive_store::Store;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PayloadError;

/// Payloads up to this size live inline in the store; bigger ones become
/// blob files under the cache root, named by content hash.
const INLINE_MAX: usize = 256 * 1024;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content-addressed registry of drone-side artifacts.
#[derive(Clone)]
pub struct PayloadRegistry {
    store: Store,
    blob_dir: PathBuf,
}

impl PayloadRegistry {
    pub fn new(store: Store, blob_dir: PathBuf) -> Self {
        Self { store, blob_dir }
    }

    fn blob_path(&self, kind: PayloadKind, hash: &str) -> PathBuf {
        self.blob_dir.join(kind.to_string()).join(hash)
    }

    /// Register `(kind, version, bytes)`. Duplicate versions are rejected by
    /// the store; identical bytes under a new version share the blob file.
    pub async fn register(
        &self,
        kind: PayloadKind,
        version: &str,
        bytes: &[u8],
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PayloadVersion, PayloadError> {
        let hash = sha256_hex(bytes);
        let (inline, content_path) = if bytes.len() <= INLINE_MAX {
            (Some(bytes), None)
        } else {
            let path = self.blob_path(kind, &hash);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PayloadError::io(parent.display().to_string(), e))?;
            }
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| PayloadError::io(path.display().to_string(), e))?;
            debug!(kind = %kind, version, path = %path.display(), "payload blob written");
            (None, Some(path.display().to_string()))
        };

        Ok(self.store.register_payload(
            kind,
            version,
            &hash,
            bytes.len() as u64,
            inline,
            content_path.as_deref(),
            notes,
            now,
        )?)
    }

    /// A local file path holding the payload bytes, for rsync. Inline
    /// payloads are spilled to the cache first.
    pub async fn materialize(&self, payload: &PayloadVersion) -> Result<PathBuf, PayloadError> {
        if let Some(path) = &payload.content_path {
            return Ok(PathBuf::from(path));
        }
        let bytes = self
            .store
            .get_payload_content(payload.kind, &payload.version)?
            .ok_or_else(|| PayloadError::NotFound {
                kind: payload.kind.to_string(),
                version: payload.version.clone(),
            })?;
        let path = self.blob_path(payload.kind, &payload.hash);
        if !Path::new(&path).exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PayloadError::io(parent.display().to_string(), e))?;
            }
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| PayloadError::io(path.display().to_string(), e))?;
        }
        Ok(path)
    }

    pub fn get(
        &self,
        kind: PayloadKind,
        version: &str,
    ) -> Result<PayloadVersion, PayloadError> {
        self.store
            .get_payload(kind, version)?
            .ok_or_else(|| PayloadError::NotFound {
                kind: kind.to_string(),
                version: version.to_string(),
            })
    }
}
