use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_GEO_API_URL: &str =
    "http://ip-api.com/json/{ip}?fields=status,regionName,city,country,org,hosting,timezone,isp,as";

const DEFAULT_RESIDENTIAL_ISPS: &[&str] = &[
    "telefonica",
    "movistar",
    "orange",
    "vodafone",
    "masmovil",
    "yoigo",
    "jazztel",
    "digi",
    "lowi",
    "euskaltel",
    "telecable",
    "r cable",
];

const GEO_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=9;

const DEFAULT_EVENT_TYPES: &[&str] = &["contact_submit", "project_click"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub admin_token: String,
    pub cors_origins: Vec<String>,
    pub geo_api_url: String,
    pub geo_timeout: Duration,
    pub residential_isps: Vec<String>,
    pub allowed_event_types: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_path: "portfolio.db".to_string(),
            admin_token: "dev-secret".to_string(),
            cors_origins: vec!["http://localhost:5173".to_string()],
            geo_api_url: DEFAULT_GEO_API_URL.to_string(),
            geo_timeout: Duration::from_secs(3),
            residential_isps: to_owned_list(DEFAULT_RESIDENTIAL_ISPS),
            allowed_event_types: to_owned_list(DEFAULT_EVENT_TYPES),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment. A `.env` file is
    /// loaded first when one exists; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a valid port number, got {:?}", port))?;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = path;
        }
        if let Some(token) = lookup("ADMIN_TOKEN") {
            config.admin_token = token;
        }
        if let Some(origins) = lookup("CORS_ORIGIN") {
            config.cors_origins = split_list(&origins);
        }
        if let Some(url) = lookup("GEO_API_URL") {
            config.geo_api_url = url;
        }
        if let Some(secs) = lookup("GEO_TIMEOUT_SECS") {
            let context =
                || format!("GEO_TIMEOUT_SECS must be a whole number of seconds from 1 to 9, got {:?}", secs);
            let parsed: u64 = secs.trim().parse().with_context(context)?;
            if !GEO_TIMEOUT_RANGE.contains(&parsed) {
                return Err(anyhow!(context()));
            }
            config.geo_timeout = Duration::from_secs(parsed);
        }
        if let Some(isps) = lookup("RESIDENTIAL_ISPS") {
            config.residential_isps = split_list(&isps)
                .into_iter()
                .map(|isp| isp.to_lowercase())
                .collect();
        }
        if let Some(types) = lookup("ALLOWED_EVENT_TYPES") {
            config.allowed_event_types = split_list(&types);
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn to_owned_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
