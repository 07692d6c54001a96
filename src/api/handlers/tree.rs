//! Collection and namespace handlers: MKCOL, MOVE, COPY.

use super::{created_or_replaced, empty_response, AppState};
use crate::api::extractors::DavPath;
use crate::api::headers::Destination;
use crate::error::DavError;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use tracing::info;

/// MKCOL handler
pub(super) async fn mkcol(state: &Arc<AppState>, target: &DavPath) -> Result<Response, DavError> {
    let ctx = state.service.context(&target.user).await?;
    state.service.mkcol(&ctx, &target.path).await?;
    Ok(empty_response(StatusCode::CREATED, HeaderMap::new()))
}

/// MOVE handler
pub(super) async fn move_node(
    state: &Arc<AppState>,
    target: &DavPath,
    headers: &HeaderMap,
) -> Result<Response, DavError> {
    let dest = Destination::from_headers(headers, &target.user)?;
    let ctx = state.service.context(&target.user).await?;
    info!("MOVE {}:{} -> {}", target.user, target.path, dest.path);
    let existed = state
        .service
        .move_node(&ctx, &target.path, &dest.path, dest.overwrite)
        .await?;
    Ok(empty_response(created_or_replaced(existed), HeaderMap::new()))
}

/// COPY handler
pub(super) async fn copy_node(
    state: &Arc<AppState>,
    target: &DavPath,
    headers: &HeaderMap,
) -> Result<Response, DavError> {
    let dest = Destination::from_headers(headers, &target.user)?;
    let ctx = state.service.context(&target.user).await?;
    info!("COPY {}:{} -> {}", target.user, target.path, dest.path);
    let existed = state
        .service
        .copy_node(&ctx, &target.path, &dest.path, dest.overwrite)
        .await?;
    Ok(empty_response(created_or_replaced(existed), HeaderMap::new()))
}
