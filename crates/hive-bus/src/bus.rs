use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hive_domain::{Event, EventKind};
use hive_store::Store;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

/// Most recent events kept in memory for cheap dashboard tailing.
const RING_CAPACITY: usize = 2_000;
/// Back-pressure bound on the write-behind queue.
const PERSIST_QUEUE: usize = 4_096;
/// Events persisted per commit by the writer task.
const WRITE_BATCH: usize = 64;

/// In-process publish/subscribe with durable write-behind.
///
/// `publish` never blocks: the in-memory ring overwrites its oldest entry,
/// live subscribers lag-drop, and the persistence queue drops the newest
/// event (counted) rather than stall a request.
#[derive(Clone)]
pub struct EventBus {
    ring: Arc<Mutex<VecDeque<Event>>>,
    persist_tx: mpsc::Sender<Event>,
    live_tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Build the bus plus the receiver end of the write-behind queue; the
    /// caller spawns [`run_event_writer`] with it.
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE);
        let (live_tx, _) = broadcast::channel(256);
        let bus = Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
            persist_tx,
            live_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (bus, persist_rx)
    }

    pub fn publish(&self, event: Event) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        if self.persist_tx.try_send(event.clone()).is_err() {
            // Queue full or writer gone; the hot path must not wait.
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 100 == 1 {
                warn!(dropped = n, "event persistence queue saturated");
            }
        }
        let _ = self.live_tx.send(event);
    }

    /// Newest-first tail of the in-memory ring.
    pub fn recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
        kind: Option<EventKind>,
    ) -> Vec<Event> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|e| since.map_or(true, |s| e.ts > s))
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Live feed; receivers filter by kind themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live_tx.subscribe()
    }

    /// Events lost to persistence back-pressure since start-up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain the write-behind queue into the store in small batches. Runs until
/// shutdown flips or the bus is gone, then flushes what is left.
pub async fn run_event_writer(
    store: Store,
    mut rx: mpsc::Receiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(WRITE_BATCH);
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
    // Final drain so a clean shutdown loses nothing that was queued. Must not
    // block: senders may still be alive.
    while let Ok(event) = rx.try_recv() {
        batch.push(event);
        if batch.len() >= WRITE_BATCH {
            flush(&store, &mut batch).await;
        }
    }
    if !batch.is_empty() {
        flush(&store, &mut batch).await;
    }
    debug!("event writer stopped");
}

async fn flush(store: &Store, batch: &mut Vec<Event>) {
    let events = std::mem::take(batch);
    let store = store.clone();
    let result =
        tokio::task::spawn_blocking(move || store.append_events(&events)).await;
    match result {
        Ok(Err(e)) => warn!(error = %e, "event batch persist failed"),
        Err(e) => warn!(error = %e, "event writer task failed"),
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_overwrites_oldest() {
        let (bus, _rx) = EventBus::new();
        for i in 0..(RING_CAPACITY + 10) {
            bus.publish(Event::new(EventKind::Error, format!("e{}", i)));
        }
        let recent = bus.recent(RING_CAPACITY + 10, None, None);
        assert_eq!(recent.len(), RING_CAPACITY);
        // newest first; the oldest ten were overwritten
        assert_eq!(recent[0].message, format!("e{}", RING_CAPACITY + 9));
        assert_eq!(recent.last().unwrap().message, "e10");
    }

    #[test]
    fn recent_filters_by_kind() {
        let (bus, _rx) = EventBus::new();
        bus.publish(Event::new(EventKind::Registered, "r"));
        bus.publish(Event::new(EventKind::Blocked, "b"));
        bus.publish(Event::new(EventKind::Registered, "r2"));
        let only = bus.recent(10, None, Some(EventKind::Registered));
        assert_eq!(only.len(), 2);
        assert!(only.iter().all(|e| e.kind == EventKind::Registered));
    }

    #[test]
    fn publish_survives_full_persist_queue() {
        let (bus, rx) = EventBus::new();
        drop(rx); // writer gone: every try_send fails
        for _ in 0..10 {
            bus.publish(Event::new(EventKind::Error, "x"));
        }
        assert_eq!(bus.dropped(), 10);
        assert_eq!(bus.recent(100, None, None).len(), 10);
    }

    #[tokio::test]
    async fn writer_persists_batches() {
        let store = Store::open_in_memory().unwrap();
        let (bus, rx) = EventBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = tokio::spawn(run_event_writer(store.clone(), rx, shutdown_rx));

        bus.publish(Event::new(EventKind::Registered, "alpha up"));
        bus.publish(Event::new(EventKind::Assigned, "work out"));
        drop(bus); // close the queue so the writer drains and exits
        writer.await.unwrap();
        drop(shutdown_tx);

        let stored = store.list_events(10, None, None, None).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn subscriber_sees_published_events() {
        let (bus, _rx) = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(Event::new(EventKind::Control, "pause"));
        let got = sub.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::Control);
    }
}
