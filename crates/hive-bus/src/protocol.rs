use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hive_domain::ProtocolEntry;
use hive_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Back-pressure bound on queued protocol entries.
const QUEUE_CAPACITY: usize = 4_096;
/// Entries persisted per commit.
const WRITE_BATCH: usize = 64;

/// Symbolic tag for an inbound exchange, derived from method and path prefix.
pub fn classify(method: &str, path: &str) -> &'static str {
    match (method, path) {
        ("POST", "/api/v1/register") => "register",
        ("GET", p) if p.starts_with("/api/v1/work") => "work-request",
        ("POST", "/api/v1/complete") => "complete",
        ("POST", "/api/v1/queue") => "queue-submit",
        ("POST", "/api/v1/control") => "control",
        (_, p) if p.starts_with("/api/v1/nodes") => {
            if method == "GET" {
                "nodes"
            } else {
                "node-control"
            }
        }
        (_, p) if p.starts_with("/api/v1/ping") || p.starts_with("/api/v1/escalation") => {
            "self-heal"
        }
        (_, p) if p.starts_with("/api/v1/sql") => "admin-sql",
        (_, p) if p.starts_with("/admin/api/payloads") => "admin-deploy",
        (_, p) if p.starts_with("/admin/api/releases") => "admin-release",
        (_, p) if p.starts_with("/admin/api/logs") || p.starts_with("/admin/api/drones") => {
            "admin-logs"
        }
        ("GET", p)
            if p.starts_with("/api/v1/events")
                || p.starts_with("/api/v1/history")
                || p.starts_with("/api/v1/sessions")
                || p.starts_with("/api/v1/status")
                || p.starts_with("/api/v1/health") =>
        {
            "read"
        }
        _ => "other",
    }
}

/// Hands completed exchanges to one background writer so the request path
/// stays hot. Saturation drops the newest entry, counted.
#[derive(Clone)]
pub struct ProtocolRecorder {
    tx: mpsc::Sender<ProtocolEntry>,
    dropped: Arc<AtomicU64>,
}

impl ProtocolRecorder {
    pub fn new() -> (Self, mpsc::Receiver<ProtocolEntry>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn record(&self, entry: ProtocolEntry) {
        if self.tx.try_send(entry).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 100 == 1 {
                warn!(dropped = n, "protocol log queue saturated");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The single protocol-log writer task.
pub async fn run_protocol_writer(
    store: Store,
    mut rx: mpsc::Receiver<ProtocolEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch: Vec<ProtocolEntry> = Vec::with_capacity(WRITE_BATCH);
    loop {
        tokio::select! {
            n = rx.recv_many(&mut batch, WRITE_BATCH) => {
                if n == 0 {
                    break;
                }
                flush(&store, &mut batch).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    while let Ok(entry) = rx.try_recv() {
        batch.push(entry);
        if batch.len() >= WRITE_BATCH {
            flush(&store, &mut batch).await;
        }
    }
    if !batch.is_empty() {
        flush(&store, &mut batch).await;
    }
    debug!("protocol writer stopped");
}

async fn flush(store: &Store, batch: &mut Vec<ProtocolEntry>) {
    let entries = std::mem::take(batch);
    let store = store.clone();
    let result =
        tokio::task::spawn_blocking(move || store.append_protocol_entries(&entries)).await;
    match result {
        Ok(Err(e)) => warn!(error = %e, "protocol batch persist failed"),
        Err(e) => warn!(error = %e, "protocol writer task failed"),
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn classification_table() {
        assert_eq!(classify("POST", "/api/v1/register"), "register");
        assert_eq!(classify("GET", "/api/v1/work?id=d1&cores=16"), "work-request");
        assert_eq!(classify("POST", "/api/v1/complete"), "complete");
        assert_eq!(classify("POST", "/api/v1/queue"), "queue-submit");
        assert_eq!(classify("POST", "/api/v1/control"), "control");
        assert_eq!(classify("GET", "/api/v1/nodes"), "nodes");
        assert_eq!(classify("POST", "/api/v1/nodes/alpha/pause"), "node-control");
        assert_eq!(classify("GET", "/api/v1/ping/all"), "self-heal");
        assert_eq!(classify("GET", "/api/v1/sql/query"), "admin-sql");
        assert_eq!(
            classify("POST", "/admin/api/payloads/drone_binary/v1/deploy"),
            "admin-deploy"
        );
        assert_eq!(classify("POST", "/admin/api/releases/1.0/promote"), "admin-release");
        assert_eq!(classify("GET", "/admin/api/logs/control-plane"), "admin-logs");
        assert_eq!(classify("GET", "/api/v1/events"), "read");
        assert_eq!(classify("GET", "/favicon.ico"), "other");
    }

    #[tokio::test]
    async fn recorder_feeds_the_writer() {
        let store = Store::open_in_memory().unwrap();
        let (recorder, rx) = ProtocolRecorder::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = tokio::spawn(run_protocol_writer(store.clone(), rx, shutdown_rx));

        recorder.record(ProtocolEntry {
            ts: Utc::now(),
            source: "10.0.0.9".into(),
            method: "POST".into(),
            path: "/api/v1/register".into(),
            tag: classify("POST", "/api/v1/register").into(),
            status: 200,
            latency_ms: 2.0,
            drone: None,
            package: None,
            request_body: "{}".into(),
            response_body: "{}".into(),
        });
        drop(recorder);
        writer.await.unwrap();

        let entries = store.list_protocol_entries(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, "register");
    }
}
