use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

/// Location and network data attached to a visit. A lookup that was skipped
/// or failed is represented by `GeoResult::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoResult {
    pub city: String,
    pub region: String,
    pub country: String,
    pub org: String,
    pub is_company: bool,
    pub timezone: String,
    pub isp: String,
    pub as_number: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("geo lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geo provider answered with HTTP {0}")]
    Status(u16),
    #[error("geo provider reported status {0:?}")]
    Provider(String),
    #[error("geo provider response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not an IP address: {0:?}")]
    InvalidAddress(String),
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoResult, EnrichmentError>;
}

fn private_pattern() -> &'static Regex {
    static PRIVATE: OnceLock<Regex> = OnceLock::new();
    PRIVATE.get_or_init(|| {
        Regex::new(r"^(127\.|10\.|192\.168\.|172\.(1[6-9]|2\d|3[01])\.)")
            .expect("valid private range pattern")
    })
}

/// True for RFC1918 ranges, loopback and the empty/`unknown` sentinels.
/// These addresses are never sent to the geo provider.
pub fn is_private_ip(ip: &str) -> bool {
    let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);
    ip.is_empty() || ip == "unknown" || ip == "::1" || private_pattern().is_match(ip)
}

/// Best-effort guess: an organisation whose name contains one of the known
/// consumer ISP fragments is treated as residential traffic.
pub fn is_residential_isp(org: &str, residential_isps: &[String]) -> bool {
    let org = org.to_lowercase();
    residential_isps
        .iter()
        .any(|fragment| org.contains(&fragment.to_lowercase()))
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(rename = "regionName", default)]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    hosting: Option<bool>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(rename = "as", default)]
    as_number: Option<String>,
}

/// Decodes an ip-api style body and applies the company/residential rule:
/// hosting networks are companies, and so is anything not on the residential list.
pub fn parse_geo_response(
    body: &str,
    residential_isps: &[String],
) -> Result<GeoResult, EnrichmentError> {
    let response: IpApiResponse = serde_json::from_str(body)?;
    if response.status != "success" {
        return Err(EnrichmentError::Provider(response.status));
    }

    let org = response.org.unwrap_or_default();
    let hosting = response.hosting.unwrap_or(false);
    let is_company = hosting || !is_residential_isp(&org, residential_isps);

    Ok(GeoResult {
        city: response.city.unwrap_or_default(),
        region: response.region_name.unwrap_or_default(),
        country: response.country.unwrap_or_default(),
        org,
        is_company,
        timezone: response.timezone.unwrap_or_default(),
        isp: response.isp.unwrap_or_default(),
        as_number: response.as_number.unwrap_or_default(),
    })
}

/// Resolves addresses through an ip-api compatible HTTP endpoint.
///
/// Every call is a fresh request: there is no cache and no retry, so the same
/// address looked up twice hits the provider twice.
pub struct IpApiResolver {
    client: reqwest::Client,
    url_template: String,
    residential_isps: Vec<String>,
}

impl IpApiResolver {
    pub fn new(
        url_template: String,
        timeout: Duration,
        residential_isps: Vec<String>,
    ) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template,
            residential_isps,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, EnrichmentError> {
        Self::new(
            config.geo_api_url.clone(),
            config.geo_timeout,
            config.residential_isps.clone(),
        )
    }

    fn url_for(&self, ip: &str) -> String {
        self.url_template.replace("{ip}", ip)
    }
}

#[async_trait]
impl GeoLookup for IpApiResolver {
    async fn lookup(&self, ip: &str) -> Result<GeoResult, EnrichmentError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| EnrichmentError::InvalidAddress(ip.to_string()))?;
        let url = self.url_for(&ip.to_string());
        debug!("Geo lookup: {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_geo_response(&body, &self.residential_isps)
    }
}
