//! Virtual paths and backend naming rules.
//!
//! A [`VirtualPath`] is a container name followed by the segments of a
//! file or directory inside it.  The container maps onto a backend
//! namespace (bucket, collection, topic family), so each backend plugs in
//! a [`PathValidator`] that rejects names the namespace cannot hold.
//! Validation happens when a path is resolved, never per operation.

use std::fmt;

use crate::errors::{BlobError, Result};

/// Separator between path elements.
pub const SEPARATOR: &str = "/";
pub const SEPARATOR_CHAR: char = '/';

/// A container-qualified path, compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath {
    elements: Vec<String>,
}

impl VirtualPath {
    /// Build a path from its container and the segments below it.
    pub fn new<I, S>(container: &str, segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut elements = vec![container.to_string()];
        elements.extend(segments.into_iter().map(Into::into));
        Self::from_elements(elements)
    }

    /// Parse `container/seg/seg` notation.  Leading, trailing and repeated
    /// separators are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let elements = raw
            .split(SEPARATOR_CHAR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self::from_elements(elements)
    }

    fn from_elements(elements: Vec<String>) -> Result<Self> {
        if elements.is_empty() {
            return Err(BlobError::invalid_argument("path has no container"));
        }
        for element in &elements {
            if element.is_empty() || element.contains(SEPARATOR_CHAR) {
                return Err(BlobError::naming(element, "empty or contains a separator"));
            }
            if element == "." || element == ".." {
                return Err(BlobError::naming(element, "relative path element"));
            }
        }
        Ok(Self { elements })
    }

    /// The backend namespace this path lives in.
    pub fn container(&self) -> &str {
        &self.elements[0]
    }

    /// Segments below the container.
    pub fn segments(&self) -> &[String] {
        &self.elements[1..]
    }

    /// All elements including the container.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Last element (the container itself for a root path).
    pub fn name(&self) -> &str {
        self.elements.last().map(String::as_str).unwrap_or_default()
    }

    /// True if this path names only a container.
    pub fn is_container(&self) -> bool {
        self.elements.len() == 1
    }

    /// All elements joined by [`SEPARATOR`].
    pub fn full_qualified_name(&self) -> String {
        self.elements.join(SEPARATOR)
    }

    /// Segments below the container joined by [`SEPARATOR`].
    pub fn container_relative_name(&self) -> String {
        self.segments().join(SEPARATOR)
    }

    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_container() {
            return None;
        }
        Some(Self {
            elements: self.elements[..self.elements.len() - 1].to_vec(),
        })
    }

    /// Append one segment.
    pub fn child(&self, name: &str) -> Result<VirtualPath> {
        let mut elements = self.elements.clone();
        elements.push(name.to_string());
        Self::from_elements(elements)
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &VirtualPath) -> bool {
        other.elements.len() > self.elements.len()
            && other.elements[..self.elements.len()] == self.elements[..]
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_qualified_name())
    }
}

// -- Validators ---------------------------------------------------------------

/// Backend-specific naming rules, applied once at path resolution.
pub trait PathValidator: Send + Sync + 'static {
    fn validate(&self, path: &VirtualPath) -> Result<()>;
}

/// Accepts every structurally valid path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpValidator;

impl PathValidator for NoOpValidator {
    fn validate(&self, _path: &VirtualPath) -> Result<()> {
        Ok(())
    }
}

/// S3 bucket naming rules for the container element.
///
/// Rules:
/// - 3-63 characters long
/// - Only lowercase letters, numbers, hyphens, and periods
/// - Must begin and end with a letter or number
/// - Cannot be formatted as an IP address (e.g., 192.168.5.4)
/// - Must not start with `xn--` or end with `-s3alias` or `--ol-s3`
#[derive(Debug, Default, Clone, Copy)]
pub struct BucketNameValidator;

impl PathValidator for BucketNameValidator {
    fn validate(&self, path: &VirtualPath) -> Result<()> {
        validate_bucket_name(path.container())
    }
}

pub fn validate_bucket_name(name: &str) -> Result<()> {
    if !(3..=63).contains(&name.len()) {
        return Err(BlobError::naming(name, "bucket names must be 3-63 characters"));
    }

    if name
        .chars()
        .any(|ch| !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' && ch != '.')
    {
        return Err(BlobError::naming(
            name,
            "only lowercase letters, digits, hyphens and periods are allowed",
        ));
    }

    let alnum = |ch: Option<char>| ch.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(BlobError::naming(name, "must begin and end with a letter or digit"));
    }

    if looks_like_ip(name) {
        return Err(BlobError::naming(name, "must not be formatted as an IP address"));
    }

    if name.starts_with("xn--") {
        return Err(BlobError::naming(name, "must not start with xn--"));
    }

    if name.ends_with("-s3alias") || name.ends_with("--ol-s3") {
        return Err(BlobError::naming(name, "reserved suffix"));
    }

    Ok(())
}

/// Check whether a string looks like an IPv4 address (e.g., "192.168.5.4").
fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.parse::<u8>().is_ok())
}

/// Collection naming rules for document stores.
///
/// The container becomes a table name, so besides the reserved document
/// store prefixes it is restricted to characters safe in an identifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectionNameValidator;

/// Longest collection name accepted.
pub const MAX_COLLECTION_NAME_LEN: usize = 120;

impl PathValidator for CollectionNameValidator {
    fn validate(&self, path: &VirtualPath) -> Result<()> {
        let name = path.container();
        if name.len() > MAX_COLLECTION_NAME_LEN {
            return Err(BlobError::naming(name, "collection name too long"));
        }
        if name.contains('$') || name.contains('\0') {
            return Err(BlobError::naming(name, "collection names must not contain '$' or NUL"));
        }
        if name.starts_with("system.") {
            return Err(BlobError::naming(name, "the system. prefix is reserved"));
        }
        if name
            .chars()
            .any(|ch| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '-' && ch != '.')
        {
            return Err(BlobError::naming(
                name,
                "only letters, digits, '_', '-' and '.' are allowed",
            ));
        }
        Ok(())
    }
}

/// Topic naming rules for log brokers.
///
/// A file maps onto its own topic, so the whole path is checked, not just
/// the container.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopicNameValidator;

/// Longest topic name a broker accepts.
pub const MAX_TOPIC_NAME_LEN: usize = 249;

impl PathValidator for TopicNameValidator {
    fn validate(&self, path: &VirtualPath) -> Result<()> {
        let topic = topic_name(path);
        if topic.len() > MAX_TOPIC_NAME_LEN {
            return Err(BlobError::naming(topic, "topic names are limited to 249 characters"));
        }
        if topic == "." || topic == ".." {
            return Err(BlobError::naming(topic, "reserved topic name"));
        }
        Ok(())
    }
}

/// Derive the broker topic for a path: separators and every character
/// outside `[a-zA-Z0-9._-]` become `_`.
pub fn topic_name(path: &VirtualPath) -> String {
    path.full_qualified_name()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
