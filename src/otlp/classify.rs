//! Pure classification logic for the OTLP Metrics Filter (C5): lookup-key
//! derivation and the used/unused/unknown decision. No I/O, no locks —
//! exercised directly by unit tests without a database.

use std::collections::HashMap;

/// Per-lookup-key classification, resolved from `metrics_usage_summary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    /// At least one usage counter is positive.
    Used,
    /// A catalog row exists and every usage counter is zero.
    Unused,
    /// No catalog row, or the lookup failed; always kept (fail-open).
    Unknown,
}

/// The metric shapes OTLP distinguishes for lookup-key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricShape {
    /// Gauge, Sum (counter or non-monotonic sum).
    Simple,
    Histogram,
    Summary,
}

/// Derives the lookup-key set for `name` under `shape`.
pub fn lookup_keys(name: &str, shape: MetricShape) -> Vec<String> {
    match shape {
        MetricShape::Simple => vec![name.to_owned()],
        MetricShape::Histogram => vec![format!("{name}_bucket"), format!("{name}_count"), format!("{name}_sum")],
        MetricShape::Summary => vec![name.to_owned(), format!("{name}_count"), format!("{name}_sum")],
    }
}

/// Resolves the per-metric keep/drop decision from the resolved states of
/// its lookup keys. Simple metrics keep unless definitively unused;
/// composite (histogram/summary) metrics fail open on any unknown variant.
pub fn should_keep(shape: MetricShape, states: &[SeriesState]) -> bool {
    match shape {
        MetricShape::Simple => !matches!(states.first(), Some(SeriesState::Unused)),
        MetricShape::Histogram | MetricShape::Summary => {
            states.iter().any(|s| matches!(s, SeriesState::Used | SeriesState::Unknown))
        }
    }
}

/// Resolves states for a batch of lookup keys: cache hits first, then a
/// single batch Provider lookup for the remainder. Returns `(states,
/// keys_that_missed_the_cache)` so the caller can populate the cache after
/// the Provider call.
pub fn resolve_states(
    keys: &[String],
    cache_hits: &HashMap<String, SeriesState>,
    catalog_rows: &HashMap<String, bool>,
) -> HashMap<String, SeriesState> {
    let mut resolved = HashMap::with_capacity(keys.len());
    for key in keys {
        if let Some(state) = cache_hits.get(key) {
            resolved.insert(key.clone(), *state);
            continue;
        }
        let state = match catalog_rows.get(key) {
            Some(true) => SeriesState::Used,
            Some(false) => SeriesState::Unused,
            None => SeriesState::Unknown,
        };
        resolved.insert(key.clone(), state);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_metric_keys_are_the_metric_name() {
        assert_eq!(lookup_keys("up", MetricShape::Simple), vec!["up".to_owned()]);
    }

    #[test]
    fn histogram_keys_are_bucket_count_sum() {
        assert_eq!(
            lookup_keys("http_duration", MetricShape::Histogram),
            vec!["http_duration_bucket".to_owned(), "http_duration_count".to_owned(), "http_duration_sum".to_owned()]
        );
    }

    #[test]
    fn summary_keys_include_the_bare_name() {
        assert_eq!(
            lookup_keys("rpc_latency", MetricShape::Summary),
            vec!["rpc_latency".to_owned(), "rpc_latency_count".to_owned(), "rpc_latency_sum".to_owned()]
        );
    }

    #[test]
    fn simple_metric_dropped_only_when_unused() {
        assert!(!should_keep(MetricShape::Simple, &[SeriesState::Unused]));
        assert!(should_keep(MetricShape::Simple, &[SeriesState::Used]));
        assert!(should_keep(MetricShape::Simple, &[SeriesState::Unknown]));
    }

    #[test]
    fn composite_metric_kept_if_any_variant_used_or_unknown() {
        assert!(should_keep(MetricShape::Histogram, &[SeriesState::Unused, SeriesState::Used, SeriesState::Unused]));
        assert!(should_keep(MetricShape::Histogram, &[SeriesState::Unused, SeriesState::Unknown, SeriesState::Unused]));
        assert!(!should_keep(MetricShape::Histogram, &[SeriesState::Unused, SeriesState::Unused, SeriesState::Unused]));
    }

    #[test]
    fn cache_hits_short_circuit_catalog_lookup() {
        let mut hits = HashMap::new();
        hits.insert("up".to_owned(), SeriesState::Used);
        let catalog = HashMap::new();
        let resolved = resolve_states(&["up".to_owned()], &hits, &catalog);
        assert_eq!(resolved["up"], SeriesState::Used);
    }

    #[test]
    fn missing_catalog_row_resolves_unknown() {
        let hits = HashMap::new();
        let catalog = HashMap::new();
        let resolved = resolve_states(&["ghost".to_owned()], &hits, &catalog);
        assert_eq!(resolved["ghost"], SeriesState::Unknown);
    }
}
