//! Request header parsing for uploads and MOVE/COPY

use crate::dav::parse_mtime;
use crate::error::{DavError, DavResult, ErrorKind};
use crate::types::normalize_path;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

/// Route prefix under which every user's files are served
pub const FILES_PREFIX: &str = "/remote.php/dav/files";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_length(headers: &HeaderMap, name: &str) -> DavResult<Option<u64>> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DavError::bad_request(format!("Invalid {} header: {}", name, v))),
    }
}

/// Upload-related request headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadHeaders {
    /// `OC-Chunked` present
    pub chunked: bool,
    /// `X-Expected-Entity-Length`, else `Content-Length`
    pub expected_length: Option<u64>,
    /// `OC-Total-Length`
    pub total_length: Option<u64>,
    /// `X-OC-Mtime`
    pub mtime: Option<DateTime<Utc>>,
}

impl UploadHeaders {
    pub fn from_headers(headers: &HeaderMap) -> DavResult<Self> {
        // proxies that buffer chunked bodies report the real size here
        let expected_length = match parse_length(headers, "x-expected-entity-length")? {
            Some(len) => Some(len),
            None => parse_length(headers, "content-length")?,
        };
        let mtime = header_str(headers, "x-oc-mtime")
            .map(parse_mtime)
            .transpose()?;
        Ok(Self {
            chunked: headers.contains_key("oc-chunked"),
            expected_length,
            total_length: parse_length(headers, "oc-total-length")?,
            mtime,
        })
    }
}

/// Target of a MOVE or COPY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub path: String,
    pub overwrite: bool,
}

impl Destination {
    /// Parse `Destination` and `Overwrite`. The destination must lie in the
    /// same user's namespace.
    pub fn from_headers(headers: &HeaderMap, user: &str) -> DavResult<Self> {
        let raw = header_str(headers, "destination")
            .ok_or_else(|| DavError::bad_request("The Destination header was not supplied"))?;

        // absolute URI or absolute path
        let path_part = match raw.find("://") {
            Some(scheme_end) => {
                let rest = &raw[scheme_end + 3..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
            }
            None => raw,
        };
        let path_part = path_part.split(['?', '#']).next().unwrap_or("");

        let user_prefix = format!("{}/{}", FILES_PREFIX, urlencoding::encode(user));
        let relative = path_part
            .strip_prefix(&user_prefix)
            .or_else(|| path_part.strip_prefix(&format!("{}/{}", FILES_PREFIX, user)))
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| {
                DavError::bad_request(format!(
                    "Destination {} is outside of the files of {}",
                    raw, user
                ))
            })?;

        let decoded = urlencoding::decode(relative)
            .map_err(|_| DavError::bad_request("Destination is not valid UTF-8"))?;
        let path = normalize_path(&decoded)
            .map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;

        let overwrite = match header_str(headers, "overwrite").map(str::trim) {
            None => true,
            Some(v) if v.eq_ignore_ascii_case("T") => true,
            Some(v) if v.eq_ignore_ascii_case("F") => false,
            Some(v) => {
                return Err(DavError::bad_request(format!(
                    "The HTTP Overwrite header should be either T or F, got {}",
                    v
                )))
            }
        };

        Ok(Self { path, overwrite })
    }
}
