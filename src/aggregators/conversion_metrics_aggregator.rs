use chrono::{DateTime, Duration, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, error};

use super::{ConversionStats, FunnelDeltas, FunnelMetrics, WeekOverWeek};
use crate::event_handler::{CONTACT_SUBMIT, PROJECT_CLICK};

pub const DEFAULT_TOP_PROJECTS: u32 = 5;
pub const UNKNOWN_PROJECT_TITLE: &str = "Desconocido";

/// The tables and filters behind each funnel metric.
#[derive(Debug, Clone, Copy)]
enum FunnelSource {
    Visitors,
    CvDownloads,
    ProjectClicks,
    ContactSubmits,
    Follows,
}

impl FunnelSource {
    fn select(&self) -> &'static str {
        match self {
            FunnelSource::Visitors => "SELECT COUNT(DISTINCT anonymized_ip) FROM visits",
            FunnelSource::CvDownloads => "SELECT COUNT(*) FROM cv_downloads",
            FunnelSource::ProjectClicks | FunnelSource::ContactSubmits => {
                "SELECT COUNT(*) FROM events"
            }
            FunnelSource::Follows => "SELECT COUNT(*) FROM followers",
        }
    }

    fn event_type(&self) -> Option<&'static str> {
        match self {
            FunnelSource::ProjectClicks => Some(PROJECT_CLICK),
            FunnelSource::ContactSubmits => Some(CONTACT_SUBMIT),
            _ => None,
        }
    }
}

/// A `created_at` range; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    since: Option<i64>,
    until: Option<i64>,
}

fn count_in_window(
    conn: &rusqlite::Connection,
    source: FunnelSource,
    window: Window,
) -> Result<i64, rusqlite::Error> {
    let mut conditions = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(event_type) = source.event_type() {
        args.push(event_type.to_string().into());
        conditions.push(format!("type = ?{}", args.len()));
    }
    if let Some(since) = window.since {
        args.push(since.into());
        conditions.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(until) = window.until {
        args.push(until.into());
        conditions.push(format!("created_at < ?{}", args.len()));
    }

    let mut query = source.select().to_string();
    if !conditions.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }

    debug!("Counting {:?}: {} {:?}", source, query, args);
    conn.query_row(&query, params_from_iter(args), |row| row.get(0))
        .inspect_err(|e| error!("Failed SQL: {}: {}", query, e))
}

fn funnel_in_window(
    conn: &rusqlite::Connection,
    window: Window,
) -> Result<FunnelMetrics, rusqlite::Error> {
    Ok(FunnelMetrics {
        total_visitors: count_in_window(conn, FunnelSource::Visitors, window)?,
        cv_downloads: count_in_window(conn, FunnelSource::CvDownloads, window)?,
        project_clicks: count_in_window(conn, FunnelSource::ProjectClicks, window)?,
        contact_submits: count_in_window(conn, FunnelSource::ContactSubmits, window)?,
        follows: count_in_window(conn, FunnelSource::Follows, window)?,
    })
}

/// Rounded percentage change from `last` to `current`.
pub fn percent_change(current: i64, last: i64) -> Option<i64> {
    if last == 0 {
        return None;
    }
    Some(((current - last) as f64 / last as f64 * 100.0).round() as i64)
}

impl FunnelDeltas {
    pub fn between(this_week: &FunnelMetrics, last_week: &FunnelMetrics) -> Self {
        Self {
            total_visitors: percent_change(this_week.total_visitors, last_week.total_visitors),
            cv_downloads: percent_change(this_week.cv_downloads, last_week.cv_downloads),
            project_clicks: percent_change(this_week.project_clicks, last_week.project_clicks),
            contact_submits: percent_change(this_week.contact_submits, last_week.contact_submits),
            follows: percent_change(this_week.follows, last_week.follows),
        }
    }
}

/// Turns a stored click payload back into an object carrying its click count.
/// Payloads that are not JSON objects get a placeholder title.
pub fn project_entry(metadata: &str, clicks: i64) -> Value {
    match serde_json::from_str::<Value>(metadata) {
        Ok(Value::Object(mut fields)) => {
            fields.insert("clicks".to_string(), json!(clicks));
            Value::Object(fields)
        }
        _ => json!({ "title": UNKNOWN_PROJECT_TITLE, "clicks": clicks }),
    }
}

/// Read-only queries over the event, download and follower tables.
pub struct ConversionMetricsAggregator {
    db: Arc<Connection>,
}

impl ConversionMetricsAggregator {
    pub fn new(db: Arc<Connection>) -> Self {
        Self { db }
    }

    /// All-time counts, each taken on its own.
    pub async fn conversion_funnel(&self) -> Result<FunnelMetrics, tokio_rusqlite::Error> {
        self.db
            .call(|conn| funnel_in_window(conn, Window::default()).map_err(tokio_rusqlite::Error::from))
            .await
    }

    pub async fn week_over_week(&self) -> Result<WeekOverWeek, tokio_rusqlite::Error> {
        self.week_over_week_at(Utc::now()).await
    }

    /// This week is the seven days up to and including `now`; last week is
    /// the seven days before that.
    pub async fn week_over_week_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<WeekOverWeek, tokio_rusqlite::Error> {
        let week_start = (now - Duration::days(7)).timestamp();
        let last_week_start = (now - Duration::days(14)).timestamp();
        // Timestamps have second resolution; the current second still counts.
        let week_end = now.timestamp() + 1;

        self.db
            .call(move |conn| {
                let this_week = funnel_in_window(
                    conn,
                    Window {
                        since: Some(week_start),
                        until: Some(week_end),
                    },
                )?;
                let last_week = funnel_in_window(
                    conn,
                    Window {
                        since: Some(last_week_start),
                        until: Some(week_start),
                    },
                )?;

                Ok(WeekOverWeek {
                    deltas: FunnelDeltas::between(&this_week, &last_week),
                    this_week,
                    last_week,
                })
            })
            .await
    }

    pub async fn top_projects_by_clicks(
        &self,
        limit: u32,
    ) -> Result<Vec<Value>, tokio_rusqlite::Error> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT metadata, COUNT(*) AS clicks
                     FROM events
                     WHERE type = ?1 AND metadata IS NOT NULL
                     GROUP BY metadata
                     ORDER BY clicks DESC, metadata ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![PROJECT_CLICK, limit], |row| {
                        let metadata: String = row.get(0)?;
                        let clicks: i64 = row.get(1)?;
                        Ok(project_entry(&metadata, clicks))
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn stats(&self) -> Result<ConversionStats, tokio_rusqlite::Error> {
        Ok(ConversionStats {
            funnel: self.conversion_funnel().await?,
            week_over_week: self.week_over_week().await?,
            top_projects: self.top_projects_by_clicks(DEFAULT_TOP_PROJECTS).await?,
        })
    }
}
