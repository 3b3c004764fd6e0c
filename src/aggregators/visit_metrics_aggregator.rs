use chrono::{Duration, NaiveDate, Utc};
use rusqlite::params_from_iter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, error};

use super::{
    start_of_day, AudienceSplit, DailyVisitors, DeviceMetrics, MetricsOutput, PageMetrics,
    ReferrerMetrics, RegionMetrics, VisitCounts, VisitStats, SECONDS_PER_DAY,
};

pub const DEFAULT_BREAKDOWN_LIMIT: u32 = 10;
pub const DEFAULT_HISTORY_DAYS: u32 = 30;

/// Read-only queries over the visit log.
pub struct VisitMetricsAggregator {
    db: Arc<Connection>,
}

impl VisitMetricsAggregator {
    pub fn new(db: Arc<Connection>) -> Self {
        Self { db }
    }

    async fn query_count(
        &self,
        query: &'static str,
        args: Vec<i64>,
    ) -> Result<i64, tokio_rusqlite::Error> {
        debug!("Counting visits: {} {:?}", query, args);
        let result = self
            .db
            .call(move |conn| {
                let count = conn.query_row(query, params_from_iter(args), |row| row.get(0))?;
                Ok(count)
            })
            .await;

        if let Err(ref e) = result {
            error!("Failed SQL: {}: {}", query, e);
        }
        result
    }

    async fn query_grouped<T: MetricsOutput + 'static>(
        &self,
        query: &'static str,
        args: Vec<i64>,
    ) -> Result<Vec<T>, tokio_rusqlite::Error> {
        debug!("Grouping visits: {} {:?}", query, args);
        let result = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(query)?;
                let rows = stmt
                    .query_map(params_from_iter(args), |row| T::from_row(row))?
                    .filter_map(|r| r.transpose())
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await;

        if let Err(ref e) = result {
            error!("Failed SQL: {}: {}", query, e);
        }
        result
    }

    pub async fn unique_visitors(&self) -> Result<i64, tokio_rusqlite::Error> {
        self.query_count("SELECT COUNT(DISTINCT anonymized_ip) FROM visits", vec![])
            .await
    }

    pub async fn total_page_views(&self) -> Result<i64, tokio_rusqlite::Error> {
        self.query_count("SELECT COUNT(*) FROM visits", vec![]).await
    }

    pub async fn visit_counts(&self) -> Result<VisitCounts, tokio_rusqlite::Error> {
        Ok(VisitCounts {
            unique_visitors: self.unique_visitors().await?,
            total_page_views: self.total_page_views().await?,
        })
    }

    pub async fn today_visitors(&self) -> Result<i64, tokio_rusqlite::Error> {
        self.today_visitors_on(Utc::now().date_naive()).await
    }

    pub async fn today_visitors_on(&self, today: NaiveDate) -> Result<i64, tokio_rusqlite::Error> {
        self.query_count(
            "SELECT COUNT(DISTINCT anonymized_ip) FROM visits WHERE created_at >= ?1",
            vec![start_of_day(today)],
        )
        .await
    }

    /// Mean of the recorded durations; visits without one are not counted.
    pub async fn average_duration_seconds(&self) -> Result<f64, tokio_rusqlite::Error> {
        self.db
            .call(|conn| {
                let avg: Option<f64> = conn.query_row(
                    "SELECT AVG(duration_seconds) FROM visits WHERE duration_seconds IS NOT NULL",
                    [],
                    |row| row.get(0),
                )?;
                Ok(avg.unwrap_or(0.0))
            })
            .await
    }

    pub async fn by_page(&self) -> Result<Vec<PageMetrics>, tokio_rusqlite::Error> {
        self.query_grouped(
            "SELECT page, COUNT(*) AS views, COUNT(DISTINCT anonymized_ip) AS unique_visitors
             FROM visits
             GROUP BY page
             ORDER BY views DESC, page ASC",
            vec![],
        )
        .await
    }

    pub async fn by_region(&self, limit: u32) -> Result<Vec<RegionMetrics>, tokio_rusqlite::Error> {
        self.query_grouped(
            "SELECT region, COUNT(DISTINCT anonymized_ip) AS visitors
             FROM visits
             WHERE region != ''
             GROUP BY region
             ORDER BY visitors DESC, region ASC
             LIMIT ?1",
            vec![i64::from(limit)],
        )
        .await
    }

    pub async fn by_referrer(
        &self,
        limit: u32,
    ) -> Result<Vec<ReferrerMetrics>, tokio_rusqlite::Error> {
        self.query_grouped(
            "SELECT referrer, COUNT(DISTINCT anonymized_ip) AS visitors
             FROM visits
             WHERE referrer != ''
             GROUP BY referrer
             ORDER BY visitors DESC, referrer ASC
             LIMIT ?1",
            vec![i64::from(limit)],
        )
        .await
    }

    pub async fn by_device(&self) -> Result<Vec<DeviceMetrics>, tokio_rusqlite::Error> {
        self.query_grouped(
            "SELECT COALESCE(NULLIF(device, ''), 'desktop') AS device_type,
                    COUNT(DISTINCT anonymized_ip) AS visitors
             FROM visits
             GROUP BY device_type
             ORDER BY visitors DESC, device_type ASC",
            vec![],
        )
        .await
    }

    pub async fn company_vs_residential(&self) -> Result<AudienceSplit, tokio_rusqlite::Error> {
        self.db
            .call(|conn| {
                let split = conn.query_row(
                    "SELECT COUNT(DISTINCT CASE WHEN is_company = 1 THEN anonymized_ip END),
                            COUNT(DISTINCT CASE WHEN is_company = 0 THEN anonymized_ip END)
                     FROM visits",
                    [],
                    |row| {
                        Ok(AudienceSplit {
                            empresa: row.get(0)?,
                            usuario: row.get(1)?,
                        })
                    },
                )?;
                Ok(split)
            })
            .await
    }

    pub async fn daily_history(&self, days: u32) -> Result<Vec<DailyVisitors>, tokio_rusqlite::Error> {
        self.daily_history_until(days, Utc::now().date_naive()).await
    }

    /// One entry per calendar day for the `days` days ending on `today`,
    /// oldest first. Days without visits are reported as zero.
    pub async fn daily_history_until(
        &self,
        days: u32,
        today: NaiveDate,
    ) -> Result<Vec<DailyVisitors>, tokio_rusqlite::Error> {
        if days == 0 {
            return Ok(Vec::new());
        }

        let first_day = today - Duration::days(i64::from(days) - 1);
        let start = start_of_day(first_day);
        let end = start_of_day(today) + SECONDS_PER_DAY;

        let counts: HashMap<String, i64> = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT date(created_at, 'unixepoch') AS day,
                            COUNT(DISTINCT anonymized_ip) AS visitors
                     FROM visits
                     WHERE created_at >= ?1 AND created_at < ?2
                     GROUP BY day",
                )?;
                let rows = stmt
                    .query_map([start, end], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<HashMap<_, _>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        Ok(first_day
            .iter_days()
            .take(days as usize)
            .map(|day| {
                let date = day.format("%Y-%m-%d").to_string();
                let visitors = counts.get(&date).copied().unwrap_or(0);
                DailyVisitors { date, visitors }
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<VisitStats, tokio_rusqlite::Error> {
        Ok(VisitStats {
            unique_visitors: self.unique_visitors().await?,
            total_page_views: self.total_page_views().await?,
            today_visitors: self.today_visitors().await?,
            avg_duration_seconds: self.average_duration_seconds().await?,
            by_page: self.by_page().await?,
            by_region: self.by_region(DEFAULT_BREAKDOWN_LIMIT).await?,
            by_referrer: self.by_referrer(DEFAULT_BREAKDOWN_LIMIT).await?,
            by_device: self.by_device().await?,
            company_vs_residential: self.company_vs_residential().await?,
        })
    }
}

impl MetricsOutput for PageMetrics {
    fn from_row(row: &rusqlite::Row) -> Result<Option<Self>, rusqlite::Error> {
        Ok(Some(PageMetrics {
            page: row.get(0)?,
            views: row.get(1)?,
            unique_visitors: row.get(2)?,
        }))
    }
}

impl MetricsOutput for RegionMetrics {
    fn from_row(row: &rusqlite::Row) -> Result<Option<Self>, rusqlite::Error> {
        Ok(Some(RegionMetrics {
            region: row.get(0)?,
            visitors: row.get(1)?,
        }))
    }
}

impl MetricsOutput for ReferrerMetrics {
    fn from_row(row: &rusqlite::Row) -> Result<Option<Self>, rusqlite::Error> {
        Ok(Some(ReferrerMetrics {
            referrer: row.get(0)?,
            visitors: row.get(1)?,
        }))
    }
}

impl MetricsOutput for DeviceMetrics {
    fn from_row(row: &rusqlite::Row) -> Result<Option<Self>, rusqlite::Error> {
        let visitors: i64 = row.get(1)?;
        if visitors > 0 {
            Ok(Some(DeviceMetrics {
                device: row.get(0)?,
                visitors,
            }))
        } else {
            Ok(None)
        }
    }
}
