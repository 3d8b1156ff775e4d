//! Query Ingestion Pipeline (C3).
//!
//! Accepts raw query-log entries over a bounded channel, enriches each with
//! a fingerprint and label-matcher set (C1), and batches them into the
//! storage provider. Decoupling capture from storage means a slow database
//! never blocks the caller submitting queries — it only ever fills the
//! bounded channel, at which point submission starts shedding load.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::QueryIngesterConfig;
use crate::fingerprint;
use crate::observability::Metrics;
use crate::storage::{NewQuery, Provider, QueryType};

/// A raw, not-yet-enriched query-log entry as submitted by the ingress caller.
#[derive(Debug, Clone)]
pub struct RawQuery {
    pub ts: DateTime<Utc>,
    pub query_param: String,
    pub time_param: Option<String>,
    pub duration_ms: i64,
    pub status_code: i32,
    pub body_size: i64,
    pub query_type: QueryType,
    pub step: Option<f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub total_queryable_samples: i64,
    pub peak_samples: i64,
}

#[derive(Clone)]
pub struct Ingester {
    tx: mpsc::Sender<RawQuery>,
    ingest_timeout: Duration,
}

impl Ingester {
    /// Submits a raw query for async enrichment and storage. Never blocks
    /// the caller: drops the entry (and bumps the `dropped` metric) if the
    /// channel is full or the worker has shut down.
    pub async fn submit(&self, raw: RawQuery, metrics: &Metrics) {
        match self.tx.try_send(raw) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => metrics.ingest_dropped_total.with_label_values(&["channel_full"]).inc(),
            Err(mpsc::error::TrySendError::Closed(_)) => metrics.ingest_dropped_total.with_label_values(&["channel_closed"]).inc(),
        }
    }
}

/// Spawns the background worker that drains the ingestion channel, enriches
/// each raw entry, and flushes batches into `provider`. Returns the sender
/// half wrapped in [`Ingester`] plus the worker's join handle.
pub fn spawn(
    config: QueryIngesterConfig,
    provider: Arc<dyn Provider>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> (Ingester, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(config.buffer_size);
    let batch_size = config.batch_size;
    let flush_interval = config.batch_flush_interval();
    let grace_period = config.shutdown_grace_period();
    let ingest_timeout = config.ingest_timeout();

    let handle = tokio::spawn(async move {
        let mut batch: Vec<RawQuery> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutting_down = false;

        loop {
            tokio::select! {
                biased;
                maybe_raw = rx.recv(), if !shutting_down => {
                    match maybe_raw {
                        Some(raw) => {
                            batch.push(raw);
                            if batch.len() >= batch_size {
                                flush(&provider, &metrics, &mut batch, ingest_timeout).await;
                            }
                        }
                        None => shutting_down = true,
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        flush(&provider, &metrics, &mut batch, ingest_timeout).await;
                    }
                    if shutting_down && rx.is_empty() {
                        break;
                    }
                }
                Ok(()) = shutdown.changed(), if !shutting_down => {
                    if *shutdown.borrow() {
                        shutting_down = true;
                        rx.close();
                    }
                }
            }
        }

        // Drain whatever arrived between the close and the last tick, bounded
        // by the configured grace period so shutdown never hangs on a
        // producer that stopped sending.
        let _ = tokio::time::timeout(grace_period, async {
            while let Some(raw) = rx.recv().await {
                batch.push(raw);
                if batch.len() >= batch_size {
                    flush(&provider, &metrics, &mut batch, ingest_timeout).await;
                }
            }
        })
        .await;
        flush(&provider, &metrics, &mut batch, ingest_timeout).await;
    });

    (Ingester { tx, ingest_timeout }, handle)
}

async fn flush(provider: &Arc<dyn Provider>, metrics: &Metrics, batch: &mut Vec<RawQuery>, ingest_timeout: Duration) {
    if batch.is_empty() {
        return;
    }
    let enriched: Vec<NewQuery> = batch.drain(..).map(enrich).collect();
    let count = enriched.len();
    metrics.query_ingester_batch_size.observe(count as f64);
    match tokio::time::timeout(ingest_timeout, provider.insert_queries(&enriched)).await {
        Ok(Ok(())) => metrics.ingest_flushed_total.inc_by(count as u64),
        Ok(Err(err)) => {
            tracing::warn!(error = %crate::error::DisplayWithSources { error: &err, infix: ": " }, batch_size = count, "failed to persist query batch");
            metrics.ingest_flush_errors_total.inc();
        }
        Err(_) => {
            tracing::warn!(batch_size = count, timeout = ?ingest_timeout, "query batch insert timed out");
            metrics.ingest_flush_errors_total.inc();
        }
    }
}

fn enrich(raw: RawQuery) -> NewQuery {
    let fp = fingerprint::fingerprint(&raw.query_param);
    let matchers = fingerprint::label_matchers(&raw.query_param);
    let label_matchers = matchers.map(|sets| serde_json::to_value(sets).unwrap_or(serde_json::Value::Null));
    NewQuery {
        ts: raw.ts,
        query_param: raw.query_param,
        time_param: raw.time_param,
        duration_ms: raw.duration_ms,
        status_code: raw.status_code,
        body_size: raw.body_size,
        fingerprint: fp,
        label_matchers,
        query_type: raw.query_type,
        step: raw.step,
        start: raw.start,
        end: raw.end,
        total_queryable_samples: raw.total_queryable_samples,
        peak_samples: raw.peak_samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_does_not_block_when_channel_is_full() {
        let metrics = Arc::new(Metrics::new().expect("build metrics"));
        let (tx, _rx) = mpsc::channel(1);
        let ingester = Ingester { tx, ingest_timeout: Duration::from_secs(5) };
        let raw = RawQuery {
            ts: Utc::now(),
            query_param: "up".to_owned(),
            time_param: None,
            duration_ms: 1,
            status_code: 200,
            body_size: 1,
            query_type: QueryType::Instant,
            step: None,
            start: None,
            end: None,
            total_queryable_samples: 0,
            peak_samples: 0,
        };
        ingester.submit(raw.clone(), &metrics).await;
        let before = metrics.ingest_dropped_total.with_label_values(&["channel_full"]).get();
        let started = std::time::Instant::now();
        ingester.submit(raw, &metrics).await;
        assert!(started.elapsed() < Duration::from_millis(100), "submit must return immediately when the channel is full");
        assert_eq!(metrics.ingest_dropped_total.with_label_values(&["channel_full"]).get(), before + 1);
    }

    #[test]
    fn enrich_computes_fingerprint_and_matchers() {
        let raw = RawQuery {
            ts: Utc::now(),
            query_param: r#"up{job="node"}"#.to_owned(),
            time_param: None,
            duration_ms: 12,
            status_code: 200,
            body_size: 128,
            query_type: QueryType::Instant,
            step: None,
            start: None,
            end: None,
            total_queryable_samples: 10,
            peak_samples: 5,
        };
        let enriched = enrich(raw);
        assert_eq!(enriched.fingerprint.len(), 16);
        assert!(enriched.label_matchers.is_some());
    }
}
