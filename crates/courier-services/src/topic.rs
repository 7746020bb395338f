//! Topic helpers: wildcard matching and the file sibling topic.
//!
//! Patterns follow MQTT rules: levels are separated by `/`, `+` matches
//! exactly one level, and a trailing `#` matches the parent level and
//! everything below it.

/// Suffix of the sibling topic that carries raw file bytes.
pub const FILE_SUFFIX: &str = "/file";

/// Sibling topic for the raw bytes of a file sent on `topic`.
pub fn file_topic(topic: &str) -> String {
    format!("{topic}{FILE_SUFFIX}")
}

/// Extra subscription a file route on `pattern` needs for its raw bytes.
///
/// `None` when the pattern ends in `#`: that subscription already covers
/// the `/file` level, and `…/#/file` is not a valid filter.
pub fn file_subscription(pattern: &str) -> Option<String> {
    if pattern == "#" || pattern.ends_with("/#") {
        None
    } else {
        Some(file_topic(pattern))
    }
}

/// The metadata topic a raw-bytes topic belongs to.
pub fn metadata_topic(file_topic: &str) -> Option<&str> {
    file_topic.strip_suffix(FILE_SUFFIX)
}

/// True if `topic` is matched by the subscription `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
