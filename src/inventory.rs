//! Inventory Syncer (C4): periodically pulls `/api/v1/metadata` from
//! upstream Prometheus, upserts the metrics catalog, and refreshes the
//! usage summary rollup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::InventoryConfig;
use crate::observability::Metrics;
use crate::storage::{CatalogItem, Provider};
use crate::timerange::TimeRange;

/// Gates the sync loop to a single active instance across a fleet. The
/// default no-op implementation is always-leader, suitable for
/// single-process deployments; a Postgres-advisory-lock implementation can
/// satisfy the same trait for multi-instance deployments.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;
}

pub struct AlwaysLeader;

#[async_trait]
impl LeaderElection for AlwaysLeader {
    async fn is_leader(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    data: BTreeMap<String, Vec<MetadataEntry>>,
}

#[derive(Debug, Deserialize)]
struct MetadataEntry {
    #[serde(rename = "type")]
    metric_type: String,
    help: String,
    unit: String,
}

/// Runs the sync loop until `shutdown` fires. First tick is delayed by a
/// random jitter of up to `interval/5` to avoid a thundering herd when
/// several instances start simultaneously.
pub async fn run(
    config: InventoryConfig,
    provider: Arc<dyn Provider>,
    leader: Arc<dyn LeaderElection>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = reqwest::Client::new();
    let jitter = rand::thread_rng().gen_range(0..=(config.sync_interval().as_millis() / 5).max(1) as u64);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = tokio::time::interval(config.sync_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        if config.leader_election && !leader.is_leader().await {
            let sleep_for = backoff.min(Duration::from_secs(10));
            let jitter_ms = rand::thread_rng().gen_range(0..250);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for + Duration::from_millis(jitter_ms)) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(Duration::from_secs(10));
            continue;
        }
        backoff = Duration::from_secs(1);

        sync_once(&client, &config, &provider, &metrics).await;
    }
}

async fn sync_once(client: &reqwest::Client, config: &InventoryConfig, provider: &Arc<dyn Provider>, metrics: &Metrics) {
    let timer = metrics.inventory_sync_duration_seconds.start_timer();

    let items = match fetch_metadata(client, config).await {
        Ok(items) => items,
        Err(err) => {
            tracing::warn!(error = %err, "inventory sync: metadata fetch failed");
            metrics.inventory_sync_failure_total.inc();
            timer.stop_and_record();
            return;
        }
    };

    if let Err(err) = provider.upsert_metrics_catalog(&items).await {
        tracing::warn!(error = %crate::error::DisplayWithSources { error: &err, infix: ": " }, "inventory sync: catalog upsert failed");
        metrics.inventory_sync_failure_total.inc();
        timer.stop_and_record();
        return;
    }

    let now = chrono::Utc::now();
    let tr = TimeRange::new(now - chrono::Duration::from_std(config.time_window()).unwrap_or_default(), now);
    if let Err(err) = provider.refresh_metrics_usage_summary(tr).await {
        tracing::warn!(error = %crate::error::DisplayWithSources { error: &err, infix: ": " }, "inventory sync: summary refresh failed");
        metrics.inventory_sync_failure_total.inc();
        timer.stop_and_record();
        return;
    }

    metrics.inventory_sync_success_total.inc();
    timer.stop_and_record();
}

async fn fetch_metadata(client: &reqwest::Client, config: &InventoryConfig) -> Result<Vec<CatalogItem>, String> {
    let mut url = format!("{}/api/v1/metadata", config.prometheus_base_url.trim_end_matches('/'));
    if let Some(limit) = config.metadata_limit {
        url.push_str(&format!("?limit={limit}"));
    }
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    let body: MetadataResponse = response.json().await.map_err(|e| e.to_string())?;

    // One catalog item per metric name, taking the first entry (stable
    // tie-break on Prometheus's own response ordering).
    Ok(body
        .data
        .into_iter()
        .filter_map(|(name, entries)| {
            entries.into_iter().next().map(|entry| CatalogItem {
                name,
                metric_type: entry.metric_type,
                help: entry.help,
                unit: entry.unit,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_leader_is_always_leader() {
        assert!(AlwaysLeader.is_leader().await);
    }
}
