use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

pub mod conversion_metrics_aggregator;
pub mod visit_metrics_aggregator;

pub use conversion_metrics_aggregator::ConversionMetricsAggregator;
pub use visit_metrics_aggregator::VisitMetricsAggregator;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Maps one result row of a grouped query; `None` drops the row.
pub trait MetricsOutput: Send {
    fn from_row(row: &rusqlite::Row) -> Result<Option<Self>, rusqlite::Error>
    where
        Self: Sized;
}

/// Unix timestamp of 00:00 UTC on `date`.
pub fn start_of_day(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageMetrics {
    pub page: String,
    pub views: i64,
    pub unique_visitors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionMetrics {
    pub region: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferrerMetrics {
    pub referrer: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMetrics {
    pub device: String,
    pub visitors: i64,
}

/// Distinct networks split by the company/residential guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudienceSplit {
    pub empresa: i64,
    pub usuario: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyVisitors {
    pub date: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitStats {
    pub unique_visitors: i64,
    pub total_page_views: i64,
    pub today_visitors: i64,
    pub avg_duration_seconds: f64,
    pub by_page: Vec<PageMetrics>,
    pub by_region: Vec<RegionMetrics>,
    pub by_referrer: Vec<ReferrerMetrics>,
    pub by_device: Vec<DeviceMetrics>,
    pub company_vs_residential: AudienceSplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisitCounts {
    pub unique_visitors: i64,
    pub total_page_views: i64,
}

/// Independently counted conversion milestones. No per-visitor join is
/// implied between the fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunnelMetrics {
    pub total_visitors: i64,
    pub cv_downloads: i64,
    pub project_clicks: i64,
    pub contact_submits: i64,
    pub follows: i64,
}

/// Percentage change per funnel metric; `None` when last week had nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunnelDeltas {
    pub total_visitors: Option<i64>,
    pub cv_downloads: Option<i64>,
    pub project_clicks: Option<i64>,
    pub contact_submits: Option<i64>,
    pub follows: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeekOverWeek {
    pub this_week: FunnelMetrics,
    pub last_week: FunnelMetrics,
    pub deltas: FunnelDeltas,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionStats {
    pub funnel: FunnelMetrics,
    #[serde(flatten)]
    pub week_over_week: WeekOverWeek,
    pub top_projects: Vec<serde_json::Value>,
}
