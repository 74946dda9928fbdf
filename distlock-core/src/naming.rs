//! Mapping lock names onto backend-native names.

use sha2::{Digest, Sha256};

/// Map `name` to a backend-safe name of at most `max_len` bytes.
///
/// Valid names that fit are returned unchanged. Anything else is converted
/// with `convert`, truncated, and suffixed with the hex SHA-256 of the
/// original name, so distinct inputs never collide after escaping.
pub fn to_safe_name<V, C>(name: &str, max_len: usize, is_valid: V, convert: C) -> String
where
    V: Fn(&str) -> bool,
    C: Fn(&str) -> String,
{
    if name.len() <= max_len && is_valid(name) {
        return name.to_string();
    }

    let hash = name_hash(name);
    if hash.len() >= max_len {
        return hash[..max_len].to_string();
    }

    let converted = convert(name);
    let prefix = truncate_to_boundary(&converted, max_len - hash.len());
    format!("{}{}", prefix, hash)
}

/// Hex SHA-256 of a lock name.
pub fn name_hash(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Replace every character rejected by `keep` with `_`.
pub fn replace_invalid_chars<K>(name: &str, keep: K) -> String
where
    K: Fn(char) -> bool,
{
    name.chars().map(|c| if keep(c) { c } else { '_' }).collect()
}

fn truncate_to_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alnum(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    fn convert(name: &str) -> String {
        replace_invalid_chars(name, |c| c.is_ascii_alphanumeric() || c == '-')
    }

    #[test]
    fn test_valid_name_unchanged() {
        assert_eq!(to_safe_name("orders-1", 100, alnum, convert), "orders-1");
    }

    #[test]
    fn test_invalid_name_escaped_and_hashed() {
        let safe = to_safe_name("a/b", 100, alnum, convert);
        assert!(safe.starts_with("a_b"));
        assert_eq!(safe.len(), 3 + 64);

        // Escaping alone would collide with the literal name "a_b".
        let other = to_safe_name("a_b", 100, alnum, convert);
        assert_ne!(safe, other);
    }

    #[test]
    fn test_long_name_truncated() {
        let long = "x".repeat(500);
        let safe = to_safe_name(&long, 100, alnum, convert);
        assert_eq!(safe.len(), 100);
        assert!(safe.starts_with("xxx"));
        assert!(safe.ends_with(&name_hash(&long)));
    }

    #[test]
    fn test_tiny_limit_uses_hash_prefix() {
        let safe = to_safe_name("a/b", 16, alnum, convert);
        assert_eq!(safe, name_hash("a/b")[..16]);
    }

    #[test]
    fn test_empty_name_is_hashed() {
        let safe = to_safe_name("", 100, alnum, convert);
        assert_eq!(safe, name_hash(""));
    }

    #[test]
    fn test_multibyte_truncation() {
        let name = "é".repeat(100);
        let safe = to_safe_name(&name, 101, alnum, |n| n.to_string());
        assert!(safe.len() <= 101);
        assert!(safe.ends_with(&name_hash(&name)));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(
            to_safe_name("a b c", 50, alnum, convert),
            to_safe_name("a b c", 50, alnum, convert)
        );
    }
}
