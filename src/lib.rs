use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub mod aggregators;
pub mod anonymize;
pub mod config;
pub mod conversion_handler;
pub mod error;
pub mod event_handler;
pub mod geo;
pub mod handlers;
#[cfg(test)]
mod log_capture;
pub mod middleware;
pub mod migrations;
pub mod remote_ip;
pub mod visit_handler;

use config::Config;
use geo::GeoLookup;
use handlers::*;
use middleware::require_admin;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Connection>,
    pub geo: Arc<dyn GeoLookup>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Connection, geo: Arc<dyn GeoLookup>, config: Config) -> Self {
        Self {
            db: Arc::new(db),
            geo,
            config: Arc::new(config),
        }
    }
}

/// Builds the `/api` router. Admin reads sit behind the bearer token check.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/visits/stats", get(get_visit_stats))
        .route("/visits/history", get(get_visit_history))
        .route("/events/stats", get(get_event_stats))
        .route("/cv/downloads", get(get_cv_download_stats))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    let public = Router::new()
        .route("/health", get(health_check))
        .route("/visits", post(track_visit))
        .route("/visits/duration", post(track_duration))
        .route("/visits/count", get(get_visit_count))
        .route("/events", post(track_event))
        .route("/cv/download", post(track_cv_download))
        .route("/followers", get(get_follow_status))
        .route("/followers/toggle", post(toggle_follow));

    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .nest("/api", public.merge(admin))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
