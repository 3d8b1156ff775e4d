//! Time-range, bucket-sizing, sort, and pagination helpers (C9).

use chrono::{DateTime, Duration, Utc};

/// System-wide upper bound on `page_size` across every paginated endpoint.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Default lookback window used when a caller passes a zero-valued range.
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// A closed UTC time window, `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// `[now - DEFAULT_WINDOW_DAYS, now]`, used whenever a caller-supplied
    /// range has zero-valued bounds.
    pub fn default_window() -> Self {
        let now = Utc::now();
        Self {
            from: now - Duration::days(DEFAULT_WINDOW_DAYS),
            to: now,
        }
    }

    /// Fills zero (`DateTime::UNIX_EPOCH`) bounds with the default window,
    /// per the read-endpoint contract in the storage provider spec.
    pub fn resolve(self) -> Self {
        if self.from == DateTime::<Utc>::UNIX_EPOCH || self.to == DateTime::<Utc>::UNIX_EPOCH {
            Self::default_window()
        } else {
            self
        }
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }

    /// The immediately preceding window of equal length, ending at `from`.
    pub fn previous(&self) -> Self {
        let len = self.duration();
        Self {
            from: self.from - len,
            to: self.from,
        }
    }

    /// `[from, to]` formatted with the given `chrono` format string, in UTC.
    pub fn format(&self, layout: &str) -> (String, String) {
        (
            self.from.format(layout).to_string(),
            self.to.format(layout).to_string(),
        )
    }
}

/// Bucket granularity for time-bucketed analytical endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketGranularity {
    OneMinute,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    OneDay,
}

impl BucketGranularity {
    /// ≤1h → 1m; ≤6h → 15m; ≤24h → 30m; ≤7d → 1h; else 1d.
    pub fn for_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let span = to - from;
        if span <= Duration::hours(1) {
            Self::OneMinute
        } else if span <= Duration::hours(6) {
            Self::FifteenMinutes
        } else if span <= Duration::hours(24) {
            Self::ThirtyMinutes
        } else if span <= Duration::days(7) {
            Self::OneHour
        } else {
            Self::OneDay
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Rendering for a Postgres `interval` literal, e.g. `'15 minutes'`.
    pub fn postgres_interval(self) -> &'static str {
        match self {
            Self::OneMinute => "1 minutes",
            Self::FifteenMinutes => "15 minutes",
            Self::ThirtyMinutes => "30 minutes",
            Self::OneHour => "1 hours",
            Self::OneDay => "1 days",
        }
    }

    /// Rendering for a SQLite `datetime(..., modifier)` string, e.g. `'+15 minutes'`.
    pub fn sqlite_modifier(self) -> &'static str {
        match self {
            Self::OneMinute => "+1 minutes",
            Self::FifteenMinutes => "+15 minutes",
            Self::ThirtyMinutes => "+30 minutes",
            Self::OneHour => "+1 hours",
            Self::OneDay => "+1 days",
        }
    }

    /// Number of complete buckets covering `tr`, aligned to `tr.from`
    /// truncated to the minute: `ceil(span / bucket_duration) + 1`.
    pub fn bucket_count(self, tr: TimeRange) -> i64 {
        let span = tr.to - tr.from;
        let bucket = self.duration();
        let whole = span.num_seconds() / bucket.num_seconds().max(1);
        let remainder = span.num_seconds() % bucket.num_seconds().max(1);
        let ceil = if remainder == 0 { whole } else { whole + 1 };
        ceil + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Renders `ASC`/`DESC` with `NULLS LAST`, so every sortable endpoint
    /// pushes null sort keys to the end regardless of direction.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC NULLS LAST",
            Self::Desc => "DESC NULLS LAST",
        }
    }
}

/// A validated, SQL-injection-safe `(sort_by, sort_order)` pair. `sort_by` is
/// always one of `allowed`'s entries; `sort_order` is always `asc` or `desc`.
#[derive(Debug, Clone)]
pub struct SortSpec {
    pub sort_by: String,
    pub sort_order: SortOrder,
}

/// Coerces caller-supplied sort inputs against an endpoint-specific allow-list.
/// Anything not on the allow-list (including SQL-injection payloads) falls
/// back to `default_sort`; no user-provided text ever reaches the SQL literal.
pub fn validate_sort_field(
    sort_by: Option<&str>,
    sort_order: Option<&str>,
    allowed: &[&str],
    default_sort: &str,
) -> SortSpec {
    let sort_by = sort_by
        .filter(|candidate| allowed.contains(candidate))
        .unwrap_or(default_sort)
        .to_owned();
    let sort_order = match sort_order.map(str::to_ascii_lowercase).as_deref() {
        Some("asc") => SortOrder::Asc,
        _ => SortOrder::Desc,
    };
    SortSpec { sort_by, sort_order }
}

/// A validated `(page, page_size)` pair. `page` is at least 1; `page_size`
/// is clamped into `[1, MAX_PAGE_SIZE]`, falling back to `default_size` when
/// unset or out of range.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

pub fn validate_pagination(page: Option<u32>, page_size: Option<u32>, default_size: u32) -> Pagination {
    let page = page.filter(|&p| p >= 1).unwrap_or(1);
    let page_size = page_size
        .filter(|&size| size >= 1 && size <= MAX_PAGE_SIZE)
        .unwrap_or(default_size.min(MAX_PAGE_SIZE));
    Pagination { page, page_size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_window_is_equal_length_and_precedes_from() {
        let from = DateTime::parse_from_rfc3339("2024-01-01T00:10:00Z").unwrap().with_timezone(&Utc);
        let to = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let tr = TimeRange::new(to, from);
        let prev = tr.previous();
        assert_eq!(prev.to, tr.from);
        assert_eq!(prev.duration(), tr.duration());
    }

    #[test]
    fn bucket_granularity_matches_glossary_table() {
        let base = Utc::now();
        assert_eq!(
            BucketGranularity::for_range(base, base + Duration::minutes(30)),
            BucketGranularity::OneMinute
        );
        assert_eq!(
            BucketGranularity::for_range(base, base + Duration::hours(3)),
            BucketGranularity::FifteenMinutes
        );
        assert_eq!(
            BucketGranularity::for_range(base, base + Duration::hours(20)),
            BucketGranularity::ThirtyMinutes
        );
        assert_eq!(
            BucketGranularity::for_range(base, base + Duration::days(3)),
            BucketGranularity::OneHour
        );
        assert_eq!(
            BucketGranularity::for_range(base, base + Duration::days(10)),
            BucketGranularity::OneDay
        );
    }

    #[test]
    fn sort_field_rejects_injection_payload() {
        let spec = validate_sort_field(
            Some("x'; DROP TABLE queries;--"),
            Some("asc"),
            &["query_param", "avg_duration"],
            "query_param",
        );
        assert_eq!(spec.sort_by, "query_param");
    }

    #[test]
    fn sort_field_accepts_allow_listed_column() {
        let spec = validate_sort_field(
            Some("avg_duration"),
            Some("desc"),
            &["query_param", "avg_duration"],
            "query_param",
        );
        assert_eq!(spec.sort_by, "avg_duration");
        assert_eq!(spec.sort_order, SortOrder::Desc);
    }

    #[test]
    fn pagination_clamps_to_max_page_size() {
        let p = validate_pagination(Some(1), Some(100_000), 25);
        assert_eq!(p.page_size, 25);
    }

    #[test]
    fn pagination_defaults_on_zero_page() {
        let p = validate_pagination(Some(0), None, 25);
        assert_eq!(p.page, 1);
        assert_eq!(p.page_size, 25);
    }
}
