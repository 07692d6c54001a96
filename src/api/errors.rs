//! HTTP rendering of `DavError`: status codes and XML error bodies

use crate::error::{DavError, ErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Escape special characters for XML text content
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Get the HTTP status code for an error kind
pub fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::InvalidPath => StatusCode::BAD_REQUEST,
        ErrorKind::SizeMismatch => StatusCode::BAD_REQUEST,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::UnsupportedContent => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Locked => StatusCode::CONFLICT,
        ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PromotionFailed => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Generate the XML error body
pub fn to_xml(err: &DavError) -> String {
    let retry = if err.kind.is_retryable() {
        "\n  <o:retry xmlns:o=\"o:\">true</o:retry>"
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<d:error xmlns:d="DAV:" xmlns:s="http://sabredav.org/ns">
  <s:exception>{}</s:exception>
  <s:message>{}</s:message>{}
</d:error>"#,
        err.kind.code(),
        escape_xml(&err.message),
        retry
    )
}

impl IntoResponse for DavError {
    fn into_response(self) -> Response {
        let status = status_code(self.kind);
        let body = to_xml(&self);

        (
            status,
            [("Content-Type", "application/xml; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
