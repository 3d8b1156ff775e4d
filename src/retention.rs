//! Retention Worker (C7): periodically deletes `queries` rows older than
//! the configured maximum age.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;

use crate::config::RetentionConfig;
use crate::observability::Metrics;
use crate::storage::Provider;

/// Runs the retention loop until `shutdown` fires. The first tick is
/// consumed immediately so a fresh deployment doesn't run a delete cycle
/// while still absorbing its initial traffic burst.
pub async fn run(config: RetentionConfig, provider: Arc<dyn Provider>, metrics: Arc<Metrics>, mut shutdown: watch::Receiver<bool>) {
    if !config.enabled {
        return;
    }

    let interval = config.interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let jitter_ms = (interval.as_millis() / 5).max(1) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        tokio::select! {
            _ = ticker.tick() => {}
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        run_cycle(&config, &provider, &metrics).await;
    }
}

async fn run_cycle(config: &RetentionConfig, provider: &Arc<dyn Provider>, metrics: &Metrics) {
    let cutoff = Utc::now() - chrono::Duration::seconds(config.queries_max_age_secs);
    let timer = std::time::Instant::now();
    let result = tokio::time::timeout(config.run_timeout(), provider.delete_queries_before(cutoff)).await;
    match result {
        Ok(Ok(deleted)) => {
            tracing::info!(deleted, cutoff = %cutoff, "retention cycle completed");
            metrics.retention_deleted_total.inc_by(deleted);
            metrics.retention_run_duration_seconds.with_label_values(&["success"]).observe(timer.elapsed().as_secs_f64());
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %crate::error::DisplayWithSources { error: &err, infix: ": " }, "retention cycle failed");
            metrics.retention_failure_total.inc();
            metrics.retention_run_duration_seconds.with_label_values(&["error"]).observe(timer.elapsed().as_secs_f64());
        }
        Err(_) => {
            tracing::warn!(timeout_secs = config.run_timeout_secs, "retention cycle timed out");
            metrics.retention_failure_total.inc();
            metrics.retention_run_duration_seconds.with_label_values(&["timeout"]).observe(timer.elapsed().as_secs_f64());
        }
    }
}
