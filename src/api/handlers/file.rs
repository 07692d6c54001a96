//! Single-node handlers: PUT, GET, HEAD, DELETE.

use super::{build_file_headers, empty_response, hval, insert_etag, AppState};
use crate::api::extractors::DavPath;
use crate::api::headers::UploadHeaders;
use crate::dav::PutRequest;
use crate::error::DavError;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{info, instrument};

/// PUT handler
/// Streams the body through the upload pipeline; chunked transfers answer
/// 201 without an ETag until the last chunk has been assembled.
#[instrument(skip(state, headers, body), fields(user = %target.user, path = %target.path))]
pub(super) async fn put(
    state: &Arc<AppState>,
    target: &DavPath,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, DavError> {
    let upload = UploadHeaders::from_headers(headers)?;
    let ctx = state.service.context(&target.user).await?;

    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(stream);

    let request = PutRequest {
        path: target.path.clone(),
        body: reader,
        method: Method::PUT,
        expected_length: upload.expected_length,
        total_length: upload.total_length,
        chunked: upload.chunked,
        mtime: upload.mtime,
    };

    let result = state.service.put(&ctx, request).await;
    if let Some(metrics) = &state.metrics {
        metrics.record_put(&result, upload.chunked);
    }
    let outcome = result?;

    let mut response_headers = HeaderMap::new();
    if let Some(etag) = &outcome.etag {
        insert_etag(&mut response_headers, etag);
    }
    if outcome.mtime_accepted {
        response_headers.insert("X-OC-MTime", hval("accepted"));
    }
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    };
    Ok(empty_response(status, response_headers))
}

/// GET handler
pub(super) async fn get(state: &Arc<AppState>, target: &DavPath) -> Result<Response, DavError> {
    let ctx = state.service.context(&target.user).await?;
    let (info, handle) = state.service.get(&ctx, &target.path).await?;
    let headers = build_file_headers(&info);
    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response())
}

/// HEAD handler
pub(super) async fn head(state: &Arc<AppState>, target: &DavPath) -> Result<Response, DavError> {
    let ctx = state.service.context(&target.user).await?;
    let info = state.service.stat(&ctx, &target.path).await?;
    let headers = if info.is_dir {
        let mut h = HeaderMap::new();
        insert_etag(&mut h, &info.quoted_etag());
        h
    } else {
        build_file_headers(&info)
    };
    Ok(empty_response(StatusCode::OK, headers))
}

/// DELETE handler
pub(super) async fn delete(state: &Arc<AppState>, target: &DavPath) -> Result<Response, DavError> {
    let ctx = state.service.context(&target.user).await?;
    state.service.delete(&ctx, &target.path).await?;
    info!("DELETE {}:{}", target.user, target.path);
    Ok(empty_response(StatusCode::NO_CONTENT, HeaderMap::new()))
}
