//! WebDAV HTTP surface

mod errors;
mod extractors;
pub mod handlers;
mod headers;

pub use errors::{escape_xml, status_code, to_xml};
pub use extractors::DavPath;
pub use headers::{Destination, UploadHeaders, FILES_PREFIX};
