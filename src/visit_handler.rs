use chrono::Utc;
use regex::Regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio_rusqlite::Connection;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::anonymize::anonymize_ip;
use crate::geo::{is_private_ip, GeoLookup, GeoResult};

pub const DIRECT_REFERRER: &str = "directo";
pub const UTM_PREFIX: &str = "utm:";
pub const MIN_DURATION_SECS: f64 = 2.0;
pub const MAX_DURATION_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Mobile,
    Tablet,
    Desktop,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Tablet => "tablet",
            Device::Desktop => "desktop",
        }
    }
}

fn tablet_pattern() -> &'static Regex {
    static TABLET: OnceLock<Regex> = OnceLock::new();
    TABLET.get_or_init(|| Regex::new(r"(?i)ipad|tablet|playbook|silk|kindle").expect("valid tablet pattern"))
}

fn mobile_pattern() -> &'static Regex {
    static MOBILE: OnceLock<Regex> = OnceLock::new();
    MOBILE.get_or_init(|| {
        Regex::new(r"(?i)mobi|iphone|ipod|blackberry|opera mini|iemobile|windows phone|webos")
            .expect("valid mobile pattern")
    })
}

fn android_pattern() -> &'static Regex {
    static ANDROID: OnceLock<Regex> = OnceLock::new();
    ANDROID.get_or_init(|| Regex::new(r"(?i)android").expect("valid android pattern"))
}

/// Tablet patterns are checked before mobile ones. Android without a
/// "Mobile" token is a tablet.
pub fn classify_device(user_agent: &str) -> Device {
    let mobile = mobile_pattern().is_match(user_agent);
    let android = android_pattern().is_match(user_agent);

    if tablet_pattern().is_match(user_agent) || (android && !mobile) {
        Device::Tablet
    } else if mobile || android {
        Device::Mobile
    } else {
        Device::Desktop
    }
}

/// Reduces a referrer to a short label: the UTM tag for `utm:` values, the
/// host without `www.` for URLs, `directo` for everything else.
pub fn normalize_referrer(referrer: Option<&str>) -> String {
    let referrer = referrer.map(str::trim).unwrap_or_default();

    if let Some(tag) = referrer.strip_prefix(UTM_PREFIX) {
        let tag = tag.trim();
        if !tag.is_empty() {
            return tag.to_string();
        }
        return DIRECT_REFERRER.to_string();
    }

    Url::parse(referrer)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_lowercase()))
        .map(|host| host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DIRECT_REFERRER.to_string())
}

fn normalize_page(page: Option<&str>) -> String {
    match page.map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => "/".to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordVisitInput {
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordDurationInput {
    pub seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct VisitCount {
    pub total_visits: i64,
}

/// A visit as written to the log, before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVisit {
    pub anonymized_ip: String,
    pub page: String,
    pub geo: GeoResult,
    pub device: Device,
    pub referrer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitRecord {
    pub id: i64,
    pub anonymized_ip: String,
    pub page: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub org: String,
    pub is_company: bool,
    pub timezone: String,
    pub isp: String,
    pub as_number: String,
    pub device: String,
    pub referrer: String,
    pub duration_seconds: Option<i64>,
    pub created_at: i64,
}

pub struct VisitHandler {
    db: Arc<Connection>,
    geo: Arc<dyn GeoLookup>,
}

impl VisitHandler {
    pub fn new(db: Arc<Connection>, geo: Arc<dyn GeoLookup>) -> Self {
        Self { db, geo }
    }

    async fn resolve_location(&self, raw_ip: &str) -> GeoResult {
        if is_private_ip(raw_ip) {
            return GeoResult::default();
        }

        match self.geo.lookup(raw_ip).await {
            Ok(geo) => geo,
            Err(e) => {
                warn!("Geo enrichment unavailable for visit: {}", e);
                GeoResult::default()
            }
        }
    }

    /// Builds the enriched visit for a page view, appends it and returns the
    /// number of distinct visitors seen so far.
    pub async fn record_visit(
        &self,
        input: RecordVisitInput,
        raw_ip: &str,
        user_agent: &str,
    ) -> Result<VisitCount, tokio_rusqlite::Error> {
        let device = classify_device(user_agent);
        let geo = self.resolve_location(raw_ip).await;

        let visit = NewVisit {
            anonymized_ip: anonymize_ip(raw_ip),
            page: normalize_page(input.page.as_deref()),
            geo,
            device,
            referrer: normalize_referrer(input.referrer.as_deref()),
        };

        self.insert_visit(visit, Utc::now().timestamp()).await?;
        let total_visits = self.unique_visitor_count().await?;

        Ok(VisitCount { total_visits })
    }

    #[instrument(skip(self))]
    pub async fn insert_visit(
        &self,
        visit: NewVisit,
        created_at: i64,
    ) -> Result<i64, tokio_rusqlite::Error> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO visits (
                        anonymized_ip, page, city, region, country, org, is_company,
                        timezone, isp, as_number, device, referrer, created_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
                    ) RETURNING id",
                )?;

                let id = stmt.query_row(
                    params![
                        visit.anonymized_ip,
                        visit.page,
                        visit.geo.city,
                        visit.geo.region,
                        visit.geo.country,
                        visit.geo.org,
                        visit.geo.is_company,
                        visit.geo.timezone,
                        visit.geo.isp,
                        visit.geo.as_number,
                        visit.device.as_str(),
                        visit.referrer,
                        created_at,
                    ],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await
    }

    pub async fn unique_visitor_count(&self) -> Result<i64, tokio_rusqlite::Error> {
        self.db
            .call(|conn| {
                let count = conn.query_row(
                    "SELECT COUNT(DISTINCT anonymized_ip) FROM visits",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Attaches a session length to the caller's latest visit.
    ///
    /// Values under two seconds are ignored and longer ones are capped at an
    /// hour. Returns whether a row was updated; a missing visit is not an error.
    #[instrument(skip(self, ip))]
    pub async fn record_duration(
        &self,
        ip: &str,
        seconds: f64,
    ) -> Result<bool, tokio_rusqlite::Error> {
        if seconds.is_nan() || seconds < MIN_DURATION_SECS {
            debug!("Ignoring duration of {} seconds", seconds);
            return Ok(false);
        }

        let seconds = (seconds.round() as i64).min(MAX_DURATION_SECS);
        let anonymized_ip = anonymize_ip(ip);

        let updated = self
            .db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE visits SET duration_seconds = ?1
                     WHERE id = (
                        SELECT id FROM visits
                        WHERE anonymized_ip = ?2
                        ORDER BY created_at DESC, id DESC
                        LIMIT 1
                     )",
                    params![seconds, anonymized_ip],
                )?;
                Ok(changed)
            })
            .await?;

        Ok(updated > 0)
    }

    #[cfg(test)]
    pub(crate) async fn latest_visit(
        &self,
        ip: &str,
    ) -> Result<Option<VisitRecord>, tokio_rusqlite::Error> {
        let anonymized_ip = anonymize_ip(ip);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, anonymized_ip, page, city, region, country, org, is_company,
                            timezone, isp, as_number, device, referrer, duration_seconds, created_at
                     FROM visits
                     WHERE anonymized_ip = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                )?;

                let result = stmt.query_row(params![anonymized_ip], |row| {
                    Ok(VisitRecord {
                        id: row.get(0)?,
                        anonymized_ip: row.get(1)?,
                        page: row.get(2)?,
                        city: row.get(3)?,
                        region: row.get(4)?,
                        country: row.get(5)?,
                        org: row.get(6)?,
                        is_company: row.get(7)?,
                        timezone: row.get(8)?,
                        isp: row.get(9)?,
                        as_number: row.get(10)?,
                        device: row.get(11)?,
                        referrer: row.get(12)?,
                        duration_seconds: row.get(13)?,
                        created_at: row.get(14)?,
                    })
                });

                match result {
                    Ok(visit) => Ok(Some(visit)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(tokio_rusqlite::Error::from(e)),
                }
            })
            .await
    }
}
