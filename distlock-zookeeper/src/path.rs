//! Node path helpers.

use distlock_core::naming::{replace_invalid_chars, to_safe_name};

use crate::error::{EnsembleError, EnsembleResult};

/// Width of the zero-padded suffix the ensemble appends to sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

const MAX_NODE_NAME_LEN: usize = 255;

/// Check that `path` is an absolute node path.
pub fn validate_path(path: &str) -> EnsembleResult<()> {
    let invalid = |reason: &str| EnsembleError::InvalidPath(format!("'{}': {}", path, reason));

    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if !is_valid_node_name(segment) {
            return Err(invalid("invalid segment"));
        }
    }
    Ok(())
}

fn is_valid_node_char(c: char) -> bool {
    !matches!(c, '/' | '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}' | '\u{fff0}'..='\u{ffff}')
}

/// Whether `name` is usable as a single path segment.
pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != "zookeeper"
        && name.chars().all(is_valid_node_char)
}

/// Join a child name onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of `path`; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Sequence number the ensemble appended to `node` after `prefix`.
///
/// The ensemble counter is a signed 32-bit value printed zero-padded to ten
/// characters, so it turns negative once it wraps. Negative values map above
/// `i32::MAX` to keep creation order across the wrap.
pub fn sequence_number(node: &str, prefix: &str) -> Option<u64> {
    let suffix = node.strip_prefix(prefix)?;
    let digits = suffix.strip_prefix('-').unwrap_or(suffix);
    if suffix.len() < SEQUENCE_WIDTH
        || digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let value: i32 = suffix.parse().ok()?;
    Some(u64::from(value as u32))
}

/// Map a lock name to a node path under `root`.
pub fn lock_path(root: &str, name: &str) -> String {
    let node = to_safe_name(name, MAX_NODE_NAME_LEN, is_valid_node_name, |n| {
        replace_invalid_chars(n, is_valid_node_char)
    });
    join(root, &node)
}
