use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use std::net::SocketAddr;

use crate::conversion_handler::{ConversionHandler, DownloadCount, DownloadStats, FollowStatus};
use crate::error::AppError;
use crate::remote_ip::RemoteIp;
use crate::AppState;

pub async fn track_cv_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<DownloadCount>, AppError> {
    let ip = RemoteIp::get(&headers, &addr);
    let count = ConversionHandler::new(state.db)
        .record_cv_download(&ip)
        .await?;
    Ok(Json(count))
}

pub async fn get_cv_download_stats(
    State(state): State<AppState>,
) -> Result<Json<DownloadStats>, AppError> {
    let stats = ConversionHandler::new(state.db).cv_download_stats().await?;
    Ok(Json(stats))
}

pub async fn get_follow_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<FollowStatus>, AppError> {
    let ip = RemoteIp::get(&headers, &addr);
    let status = ConversionHandler::new(state.db).follow_status(&ip).await?;
    Ok(Json(status))
}

pub async fn toggle_follow(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<FollowStatus>, AppError> {
    let ip = RemoteIp::get(&headers, &addr);
    let status = ConversionHandler::new(state.db).toggle_follow(&ip).await?;
    Ok(Json(status))
}
