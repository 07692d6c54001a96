//! Core types for webdav_ingest: logical paths, file metadata and chunk names

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest leaf name accepted by `verify_filename`, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Marker between a target path and the random token of a staging file.
pub const STAGING_MARKER: &str = ".ocTransferId";

/// Suffix of every staging file.
pub const STAGING_SUFFIX: &str = ".part";

/// Names that may never be written through the DAV layer.
const BLACKLISTED_NAMES: &[&str] = &[".htaccess"];

/// Characters that are not allowed anywhere in a leaf name.
const RESERVED_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// Errors that can occur when validating a user-provided filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValidationError(String);

impl PathValidationError {
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PathValidationError {}

/// Check a single leaf name for reserved characters and names.
pub fn verify_filename(name: &str) -> Result<(), PathValidationError> {
    if name.is_empty() {
        return Err(PathValidationError("Empty filename is not allowed".into()));
    }
    if name == "." || name == ".." {
        return Err(PathValidationError("Dot files are not allowed".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(PathValidationError("File name is too long".into()));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(PathValidationError(format!(
            "File name contains at least one invalid character: {}",
            c
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(PathValidationError(
            "File name contains control characters".into(),
        ));
    }
    if name.ends_with(char::is_whitespace) {
        return Err(PathValidationError(
            "File name must not end with whitespace".into(),
        ));
    }
    if BLACKLISTED_NAMES
        .iter()
        .any(|b| b.eq_ignore_ascii_case(name))
    {
        return Err(PathValidationError(format!(
            "File name is a reserved word: {}",
            name
        )));
    }
    Ok(())
}

/// Normalize a logical path to `/a/b` form: leading slash, no trailing slash,
/// no empty or `.` segments. `..` segments are rejected.
pub fn normalize_path(path: &str) -> Result<String, PathValidationError> {
    let mut out = String::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PathValidationError(
                    "Path must not contain '..' segments".into(),
                ))
            }
            s => {
                if s.contains('\0') {
                    return Err(PathValidationError("Path must not contain NUL bytes".into()));
                }
                out.push('/');
                out.push_str(s);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Split a normalized path into (parent, leaf). The root splits to ("/", "").
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// Join a directory and a leaf name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Staging path for a single-shot upload of `target`.
pub fn staging_path(target: &str, token: &str) -> String {
    format!("{}{}{}{}", target, STAGING_MARKER, token, STAGING_SUFFIX)
}

/// Whether a leaf name belongs to an in-flight staging file.
pub fn is_staging_file(name: &str) -> bool {
    name.ends_with(STAGING_SUFFIX) && name.contains(STAGING_MARKER)
}

/// Permission flags of a node, as seen by the current user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub updatable: bool,
    pub creatable: bool,
    pub deletable: bool,
}

/// Metadata of a single node in a user's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Normalized logical path
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Unquoted entity tag
    pub etag: String,
    pub permissions: Permissions,
}

impl FileInfo {
    /// ETag as sent on the wire (quoted)
    pub fn quoted_etag(&self) -> String {
        format!("\"{}\"", self.etag)
    }

    pub fn is_updatable(&self) -> bool {
        self.permissions.updatable
    }

    pub fn is_creatable(&self) -> bool {
        self.permissions.creatable
    }

    pub fn is_deletable(&self) -> bool {
        self.permissions.deletable
    }
}

/// Free space reported by a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpace {
    Known(u64),
    /// The backend cannot tell. Never treated as zero.
    Unknown,
    Unlimited,
}

/// Most chunks a single transfer may be split into.
pub const MAX_CHUNK_COUNT: u32 = 10_000;

/// Decoded name of one chunk of a chunked upload:
/// `<name>-chunking-<transfer_id>-<chunk_count>-<index>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkName {
    pub name: String,
    pub transfer_id: String,
    pub chunk_count: u32,
    pub index: u32,
}

fn chunk_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<name>.+)-chunking-(?P<transfer>\d+)-(?P<count>\d+)-(?P<index>\d+)$")
            .expect("static chunk name regex")
    })
}

impl ChunkName {
    /// Parse a leaf name. Returns `None` for anything that is not a valid chunk
    /// name, including an index outside `[0, chunk_count)` or a count above
    /// `MAX_CHUNK_COUNT`.
    pub fn parse(leaf: &str) -> Option<Self> {
        let caps = chunk_name_regex().captures(leaf)?;
        let chunk_count: u32 = caps["count"].parse().ok()?;
        let index: u32 = caps["index"].parse().ok()?;
        if chunk_count == 0 || chunk_count > MAX_CHUNK_COUNT || index >= chunk_count {
            return None;
        }
        Some(Self {
            name: caps["name"].to_string(),
            transfer_id: caps["transfer"].to_string(),
            chunk_count,
            index,
        })
    }

    /// Key prefix shared by every chunk of this transfer.
    pub fn prefix(&self) -> String {
        format!(
            "{}-chunking-{}-{}-",
            self.name, self.transfer_id, self.chunk_count
        )
    }

    /// Storage key of chunk `index` of this transfer.
    pub fn key_for(&self, index: u32) -> String {
        format!("{}{}", self.prefix(), index)
    }

    /// Staging leaf name used while assembling this transfer.
    pub fn staging_name(&self) -> String {
        format!(
            "{}{}{}{}",
            self.name, STAGING_MARKER, self.transfer_id, STAGING_SUFFIX
        )
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_for(self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_verify_filename_accepts_regular_names() {
        assert!(verify_filename("report.pdf").is_ok());
        assert!(verify_filename("with space.txt").is_ok());
        assert!(verify_filename(".hidden").is_ok());
        assert!(verify_filename("ünïcödé.md").is_ok());
    }

    #[test]
    fn test_verify_filename_rejects_reserved() {
        assert!(verify_filename("").is_err());
        assert!(verify_filename(".").is_err());
        assert!(verify_filename("..").is_err());
        assert!(verify_filename("a/b").is_err());
        assert!(verify_filename("a\\b").is_err());
        assert!(verify_filename("what?").is_err());
        assert!(verify_filename("trailing ").is_err());
        assert!(verify_filename("tab\there").is_err());
        assert!(verify_filename(".htaccess").is_err());
        assert!(verify_filename(".HTACCESS").is_err());
        assert!(verify_filename(&"x".repeat(256)).is_err());
        assert!(verify_filename(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b/c.txt").unwrap(), "/a/b/c.txt");
        assert_eq!(normalize_path("//a/./b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("").unwrap(), "/");
        assert!(normalize_path("a/../b").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("/a/b.txt"), ("/a".to_string(), "b.txt".to_string()));
        assert_eq!(split_path("/b.txt"), ("/".to_string(), "b.txt".to_string()));
        assert_eq!(split_path("/"), ("/".to_string(), "".to_string()));
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }

    #[test]
    fn test_staging_names() {
        let p = staging_path("/docs/a.txt", "1234");
        assert_eq!(p, "/docs/a.txt.ocTransferId1234.part");
        assert!(is_staging_file("a.txt.ocTransferId1234.part"));
        assert!(!is_staging_file("a.part"));
        assert!(!is_staging_file("a.txt"));
    }

    #[test]
    fn test_chunk_name_parse() {
        let c = ChunkName::parse("video.mp4-chunking-4711-3-2").unwrap();
        assert_eq!(c.name, "video.mp4");
        assert_eq!(c.transfer_id, "4711");
        assert_eq!(c.chunk_count, 3);
        assert_eq!(c.index, 2);
        assert_eq!(c.key_for(0), "video.mp4-chunking-4711-3-0");
        assert_eq!(c.staging_name(), "video.mp4.ocTransferId4711.part");
    }

    #[test]
    fn test_chunk_name_with_dashes_in_name() {
        let c = ChunkName::parse("my-file-chunking-1-2-0").unwrap();
        assert_eq!(c.name, "my-file");
    }

    #[test]
    fn test_chunk_name_rejects_malformed() {
        assert!(ChunkName::parse("plain.txt").is_none());
        assert!(ChunkName::parse("a-chunking-x-2-0").is_none());
        assert!(ChunkName::parse("a-chunking-1-2-2").is_none());
        assert!(ChunkName::parse("a-chunking-1-0-0").is_none());
    }

    #[test]
    fn test_chunk_count_is_bounded() {
        let max = format!("a-chunking-1-{}-0", MAX_CHUNK_COUNT);
        assert_eq!(ChunkName::parse(&max).unwrap().chunk_count, MAX_CHUNK_COUNT);
        assert!(ChunkName::parse(&format!("a-chunking-1-{}-0", MAX_CHUNK_COUNT + 1)).is_none());
        assert!(ChunkName::parse("x-chunking-1-4000000000-0").is_none());
    }

    proptest! {
        #[test]
        fn prop_names_with_reserved_chars_are_rejected(
            prefix in "[a-z]{0,8}",
            bad in prop::sample::select(RESERVED_CHARS.to_vec()),
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{}{}{}", prefix, bad, suffix);
            prop_assert!(verify_filename(&name).is_err());
        }

        #[test]
        fn prop_plain_alphanumeric_names_are_accepted(name in "[A-Za-z0-9_.-]{1,64}") {
            prop_assume!(name != "." && name != "..");
            prop_assume!(!name.eq_ignore_ascii_case(".htaccess"));
            prop_assert!(verify_filename(&name).is_ok());
        }
    }
}
