//! Catalog Sync Buffer (C6): a debounced dedup buffer that writes metric
//! names freshly observed on the OTLP ingress path into the metrics
//! catalog, without hitting the storage provider once per data point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::CatalogSyncConfig;
use crate::observability::Metrics;
use crate::storage::{CatalogItem, Provider};

struct Buffer {
    pending: HashMap<String, String>,
    seen: HashMap<String, Instant>,
}

impl Buffer {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            seen: HashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct CatalogSyncBuffer {
    inner: Arc<Mutex<Buffer>>,
    seen_ttl: Duration,
    buffer_size: usize,
}

impl CatalogSyncBuffer {
    pub fn new(config: &CatalogSyncConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer::new())),
            seen_ttl: config.seen_ttl(),
            buffer_size: config.buffer_size,
        }
    }

    /// Enqueues `(name, metric_type)` unless it was already flushed within
    /// `SeenTTL`. Cheap enough to call on every processed OTLP metric. Once
    /// `pending` holds `buffer_size` distinct names, further new names are
    /// dropped until the next flush makes room; already-pending names still
    /// update in place.
    pub fn enqueue(&self, name: &str, metric_type: &str) {
        let mut buffer = self.inner.lock();
        if let Some(seen_at) = buffer.seen.get(name) {
            if seen_at.elapsed() < self.seen_ttl {
                return;
            }
        }
        if !buffer.pending.contains_key(name) && buffer.pending.len() >= self.buffer_size {
            tracing::warn!(name, buffer_size = self.buffer_size, "catalog sync buffer full, dropping metric");
            return;
        }
        buffer.pending.insert(name.to_owned(), metric_type.to_owned());
    }

    fn current_size(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Takes a snapshot of pending entries without clearing `seen`, since a
    /// flush failure must allow immediate retry on the next interval.
    fn snapshot(&self) -> Vec<CatalogItem> {
        let buffer = self.inner.lock();
        buffer
            .pending
            .iter()
            .map(|(name, metric_type)| CatalogItem {
                name: name.clone(),
                metric_type: metric_type.clone(),
                help: String::new(),
                unit: String::new(),
            })
            .collect()
    }

    /// Marks `items` as flushed: removed from `pending`, timestamped into
    /// `seen` so re-enqueue is suppressed until `SeenTTL` elapses.
    fn mark_flushed(&self, items: &[CatalogItem]) {
        let mut buffer = self.inner.lock();
        let now = Instant::now();
        for item in items {
            buffer.pending.remove(&item.name);
            buffer.seen.insert(item.name.clone(), now);
        }
    }
}

/// Spawns the periodic flush task. Performs one final flush on shutdown
/// before returning, per the graceful-shutdown cascade (C6 flushes after
/// C3 drains).
pub fn spawn(
    buffer: CatalogSyncBuffer,
    config: CatalogSyncConfig,
    provider: Arc<dyn Provider>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            let _ = shutdown.changed().await;
            return;
        }

        let mut ticker = tokio::time::interval(config.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(&buffer, &provider, &metrics).await;
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        flush(&buffer, &provider, &metrics).await;
    })
}

async fn flush(buffer: &CatalogSyncBuffer, provider: &Arc<dyn Provider>, metrics: &Metrics) {
    metrics.catalog_sync_buffer_size.set(buffer.current_size() as i64);
    let items = buffer.snapshot();
    if items.is_empty() {
        return;
    }
    match provider.upsert_metrics_catalog(&items).await {
        Ok(()) => {
            buffer.mark_flushed(&items);
            metrics.catalog_sync_buffer_flush_total.with_label_values(&["success"]).inc();
        }
        Err(err) => {
            // Left in `pending`: the next tick retries the same snapshot.
            tracing::warn!(error = %crate::error::DisplayWithSources { error: &err, infix: ": " }, count = items.len(), "catalog sync flush failed, will retry");
            metrics.catalog_sync_buffer_flush_total.with_label_values(&["error"]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CatalogSyncConfig {
        CatalogSyncConfig {
            enabled: true,
            flush_interval_secs: 30,
            buffer_size: 4096,
            seen_ttl_secs: 600,
        }
    }

    #[test]
    fn enqueue_dedups_within_seen_ttl() {
        let buffer = CatalogSyncBuffer::new(&config());
        buffer.enqueue("up", "gauge");
        buffer.mark_flushed(&buffer.snapshot());
        buffer.enqueue("up", "gauge");
        assert_eq!(buffer.current_size(), 0, "re-enqueue within SeenTTL must be suppressed");
    }

    #[test]
    fn enqueue_accumulates_distinct_names() {
        let buffer = CatalogSyncBuffer::new(&config());
        buffer.enqueue("up", "gauge");
        buffer.enqueue("http_requests_total", "counter");
        assert_eq!(buffer.current_size(), 2);
    }

    #[test]
    fn enqueue_drops_once_buffer_size_is_reached() {
        let buffer = CatalogSyncBuffer::new(&CatalogSyncConfig { buffer_size: 2, ..config() });
        buffer.enqueue("up", "gauge");
        buffer.enqueue("http_requests_total", "counter");
        buffer.enqueue("node_load1", "gauge");
        assert_eq!(buffer.current_size(), 2, "third distinct name must be dropped once buffer_size is reached");
    }

    #[test]
    fn enqueue_still_updates_already_pending_name_when_full() {
        let buffer = CatalogSyncBuffer::new(&CatalogSyncConfig { buffer_size: 1, ..config() });
        buffer.enqueue("up", "gauge");
        buffer.enqueue("up", "gauge");
        assert_eq!(buffer.current_size(), 1);
    }

    #[test]
    fn failed_flush_keeps_items_pending_for_retry() {
        let buffer = CatalogSyncBuffer::new(&config());
        buffer.enqueue("up", "gauge");
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.current_size(), 1, "items stay pending until mark_flushed is called");
    }
}
