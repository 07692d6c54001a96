//! Custom Axum extractors for DAV request paths
//!
//! These extractors validate the user segment and normalize the file path
//! before a handler runs, so handlers only ever see logical paths.

use crate::error::{DavError, ErrorKind};
use crate::types::normalize_path;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request::Parts,
};

/// User and normalized logical path of a DAV request
///
/// Matches both `/remote.php/dav/files/:user` (the user's root) and
/// `/remote.php/dav/files/:user/*path`.
///
/// # Example
/// ```ignore
/// async fn delete(
///     State(state): State<Arc<AppState>>,
///     DavPath { user, path }: DavPath,
/// ) -> Result<Response, DavError> {
///     // path is "/" or "/dir/file", never contains ".."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavPath {
    pub user: String,
    pub path: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for DavPath
where
    S: Send + Sync,
{
    type Rejection = DavError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(params): Path<Vec<(String, String)>> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| DavError::bad_request("Invalid request path"))?;

        let mut user = None;
        let mut raw = String::new();
        for (name, value) in params {
            match name.as_str() {
                "user" => user = Some(value),
                "path" => raw = value,
                _ => {}
            }
        }
        let user = user.ok_or_else(|| DavError::bad_request("Missing user in request path"))?;
        let path = normalize_path(&raw).map_err(|e| DavError::new(ErrorKind::InvalidPath, e.message()))?;

        Ok(DavPath { user, path })
    }
}
