use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use std::net::SocketAddr;

use super::Ack;
use crate::aggregators::{ConversionMetricsAggregator, ConversionStats};
use crate::error::AppError;
use crate::event_handler::{EventHandler, RecordEventInput};
use crate::remote_ip::RemoteIp;
use crate::AppState;

pub async fn track_event(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<RecordEventInput>, JsonRejection>,
) -> Result<Json<Ack>, AppError> {
    let Json(input) = payload?;
    let ip = RemoteIp::get(&headers, &addr);

    let handler = EventHandler::new(state.db, state.config.allowed_event_types.clone());
    handler
        .record_event(input.event_type.as_deref(), &ip, input.metadata.as_ref())
        .await?;
    Ok(Json(Ack::ok()))
}

pub async fn get_event_stats(
    State(state): State<AppState>,
) -> Result<Json<ConversionStats>, AppError> {
    let stats = ConversionMetricsAggregator::new(state.db).stats().await?;
    Ok(Json(stats))
}
