//! Blob key codec.
//!
//! A logical file is stored as blobs keyed `<file name>/<ordinal>`.  Object
//! and document stores key blobs relative to their container (the bucket or
//! collection already carries the container name); brokers and global
//! indexes use the fully qualified name.
//!
//! Two regexes drive discovery over a backend's flat key space: one matches
//! exactly the blobs of a file, the other every key below a directory.

use regex::Regex;

use crate::errors::{BlobError, Result};
use crate::path::{VirtualPath, SEPARATOR, SEPARATOR_CHAR};

/// Separator between a file's name and a blob ordinal.
pub const ORDINAL_SEPARATOR: char = '/';

/// Which part of a path a key is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Container included: `container/dir/file/0`.
    Qualified,
    /// Container omitted: `dir/file/0`.
    ContainerRelative,
}

impl KeyScope {
    fn name_of(self, path: &VirtualPath) -> String {
        match self {
            KeyScope::Qualified => path.full_qualified_name(),
            KeyScope::ContainerRelative => path.container_relative_name(),
        }
    }
}

/// Common prefix of every blob of `file`.
pub fn blob_key_prefix(file: &VirtualPath, scope: KeyScope) -> String {
    let mut prefix = scope.name_of(file);
    prefix.push(ORDINAL_SEPARATOR);
    prefix
}

/// Key of blob number `ordinal` of `file`.
pub fn blob_key(file: &VirtualPath, ordinal: u64, scope: KeyScope) -> String {
    format!("{}{ordinal}", blob_key_prefix(file, scope))
}

/// Pattern matching `prefix` followed by one or more digits and nothing else.
pub fn blob_key_regex(prefix: &str) -> Result<Regex> {
    compile(&format!("^{}[0-9]+$", regex::escape(prefix)))
}

/// Prefix shared by every key below `directory`.
pub fn child_keys_prefix(directory: &VirtualPath, scope: KeyScope) -> String {
    let name = scope.name_of(directory);
    if name.is_empty() {
        name
    } else {
        format!("{name}{SEPARATOR}")
    }
}

/// Pattern matching every key that has `directory` as a strict ancestor.
///
/// Capture group `child` holds the first element below the directory.
pub fn child_keys_regex(directory: &VirtualPath, scope: KeyScope) -> Result<Regex> {
    let prefix = child_keys_prefix(directory, scope);
    compile(&format!(
        "^{}(?P<child>[^{SEPARATOR}]+){}.+$",
        regex::escape(&prefix),
        regex::escape(&ORDINAL_SEPARATOR.to_string()),
    ))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BlobError::invalid_argument(format!("bad key pattern: {e}")))
}

/// Parse the trailing ordinal of a blob key.
pub fn ordinal_of(key: &str) -> Result<u64> {
    let (_, ordinal) = split_key(key)?;
    Ok(ordinal)
}

/// Split a blob key into file name and ordinal.
pub fn split_key(key: &str) -> Result<(&str, u64)> {
    let malformed = || BlobError::MalformedKey {
        key: key.to_string(),
    };
    let (name, digits) = key.rsplit_once(ORDINAL_SEPARATOR).ok_or_else(malformed)?;
    if name.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let ordinal = digits.parse().map_err(|_| malformed())?;
    Ok((name, ordinal))
}

/// Recover the file a blob key belongs to.
///
/// `container` is only consulted for [`KeyScope::ContainerRelative`] keys.
pub fn file_of_key(container: &str, key: &str, scope: KeyScope) -> Result<VirtualPath> {
    let (name, _) = split_key(key)?;
    let path = match scope {
        KeyScope::Qualified => VirtualPath::parse(name),
        KeyScope::ContainerRelative => {
            VirtualPath::new(container, name.split(SEPARATOR_CHAR).filter(|s| !s.is_empty()))
        }
    };
    path.map_err(|_| BlobError::MalformedKey {
        key: key.to_string(),
    })
}
