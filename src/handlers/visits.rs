use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header::USER_AGENT, HeaderMap},
    Json,
};
use std::net::SocketAddr;

use super::Ack;
use crate::aggregators::visit_metrics_aggregator::DEFAULT_HISTORY_DAYS;
use crate::aggregators::{DailyVisitors, VisitCounts, VisitMetricsAggregator, VisitStats};
use crate::error::AppError;
use crate::remote_ip::RemoteIp;
use crate::visit_handler::{RecordDurationInput, RecordVisitInput, VisitCount, VisitHandler};
use crate::AppState;

fn visit_handler(state: &AppState) -> VisitHandler {
    VisitHandler::new(state.db.clone(), state.geo.clone())
}

pub async fn track_visit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<RecordVisitInput>, JsonRejection>,
) -> Result<Json<VisitCount>, AppError> {
    let Json(input) = payload?;
    let ip = RemoteIp::get(&headers, &addr);
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    let count = visit_handler(&state)
        .record_visit(input, &ip, user_agent)
        .await?;
    Ok(Json(count))
}

pub async fn track_duration(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<RecordDurationInput>, JsonRejection>,
) -> Result<Json<Ack>, AppError> {
    let Json(input) = payload?;
    let ip = RemoteIp::get(&headers, &addr);

    visit_handler(&state)
        .record_duration(&ip, input.seconds)
        .await?;
    Ok(Json(Ack::ok()))
}

pub async fn get_visit_count(
    State(state): State<AppState>,
) -> Result<Json<VisitCounts>, AppError> {
    let counts = VisitMetricsAggregator::new(state.db).visit_counts().await?;
    Ok(Json(counts))
}

pub async fn get_visit_stats(State(state): State<AppState>) -> Result<Json<VisitStats>, AppError> {
    let stats = VisitMetricsAggregator::new(state.db).stats().await?;
    Ok(Json(stats))
}

pub async fn get_visit_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<DailyVisitors>>, AppError> {
    let history = VisitMetricsAggregator::new(state.db)
        .daily_history(DEFAULT_HISTORY_DAYS)
        .await?;
    Ok(Json(history))
}
