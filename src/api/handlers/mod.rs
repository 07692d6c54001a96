//! WebDAV request handlers
//!
//! Split into submodules by domain:
//! - `file`: PUT, GET, HEAD, DELETE for single nodes
//! - `tree`: MKCOL, MOVE, COPY
//! - `status`: Health check
//!
//! DAV verbs are not all known to the router, so one `dispatch` handler is
//! mounted with `any()` and picks the operation from the method string.

mod file;
mod status;
mod tree;

use super::extractors::DavPath;
use crate::dav::DavService;
use crate::error::{DavError, ErrorKind};
use crate::metrics::{Metrics, MetricsListener};
use crate::types::FileInfo;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

pub use status::{get_peak_rss_bytes, health_check, HealthResponse};

/// Methods answered by `dispatch`
pub const ALLOWED_METHODS: &str = "OPTIONS, GET, HEAD, DELETE, PUT, MKCOL, MOVE, COPY";

/// Application state shared across handlers
pub struct AppState {
    pub service: DavService,
    pub metrics: Option<Metrics>,
}

impl AppState {
    /// Wire metrics into the service's event bus.
    pub fn new(service: DavService, metrics: Option<Metrics>) -> Self {
        if let Some(m) = &metrics {
            service
                .events()
                .subscribe(Arc::new(MetricsListener(m.clone())));
        }
        Self { service, metrics }
    }
}

/// Entry point for every request below the files route.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    target: DavPath,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, DavError> {
    debug!("{} {}:{}", method, target.user, target.path);
    let result = match method.as_str() {
        "PUT" => file::put(&state, &target, &headers, body).await,
        "GET" => file::get(&state, &target).await,
        "HEAD" => file::head(&state, &target).await,
        "DELETE" => file::delete(&state, &target).await,
        "MKCOL" => tree::mkcol(&state, &target).await,
        "MOVE" => tree::move_node(&state, &target, &headers).await,
        "COPY" => tree::copy_node(&state, &target, &headers).await,
        "OPTIONS" => Ok(options_response()),
        other => Err(DavError::new(
            ErrorKind::MethodNotAllowed,
            format!("{} is not supported", other),
        )),
    };

    if let (Err(e), Some(metrics)) = (&result, &state.metrics) {
        if method != Method::PUT {
            metrics.record_error(e.kind());
        }
    }
    result
}

fn options_response() -> Response {
    (
        StatusCode::OK,
        [("Allow", ALLOWED_METHODS), ("DAV", "1"), ("MS-Author-Via", "DAV")],
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Shared utility functions used across handler submodules
// ---------------------------------------------------------------------------

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `ETag` and `OC-ETag` carry the same quoted value.
fn insert_etag(headers: &mut HeaderMap, quoted: &str) {
    headers.insert("ETag", hval(quoted));
    headers.insert("OC-ETag", hval(quoted));
}

/// Build response headers describing a file.
fn build_file_headers(info: &FileInfo) -> HeaderMap {
    let content_type = mime_guess::from_path(&info.path)
        .first_or_octet_stream()
        .to_string();

    let mut headers = HeaderMap::new();
    insert_etag(&mut headers, &info.quoted_etag());
    headers.insert("Content-Length", hval(&info.size.to_string()));
    headers.insert("Content-Type", hval(&content_type));
    headers.insert(
        "Last-Modified",
        hval(&info.mtime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
    );
    headers
}

/// 201 when the target was created, 204 when it replaced something.
fn created_or_replaced(existed: bool) -> StatusCode {
    if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }
}

fn empty_response(status: StatusCode, headers: HeaderMap) -> Response {
    (status, headers, Body::empty()).into_response()
}
