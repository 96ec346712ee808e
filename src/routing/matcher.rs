//! Route pattern matching.
//!
//! # Responsibilities
//! - Match `/`-delimited patterns against request paths
//! - Support `:name` and interior `*` single-segment wildcards
//! - Support a trailing `*` that accepts any remaining segments
//!
//! # Design Decisions
//! - Literal segments are case-sensitive
//! - No regex; matching is linear in the number of segments
//! - Empty segments count, so `/a/` and `/a` are different paths

/// Returns true if `path` matches `pattern`.
///
/// A trailing `*` compares only the segments before it; the path must have
/// at least that many segments. Without a trailing `*` the segment counts
/// must be equal.
pub fn match_pattern(pattern: &str, path: &str) -> bool {
    let mut pattern_parts: Vec<&str> = pattern.split('/').collect();
    let mut path_parts: Vec<&str> = path.split('/').collect();

    if pattern_parts.last() == Some(&"*") {
        pattern_parts.pop();
        if path_parts.len() < pattern_parts.len() {
            return false;
        }
        path_parts.truncate(pattern_parts.len());
    } else if pattern_parts.len() != path_parts.len() {
        return false;
    }

    pattern_parts
        .iter()
        .zip(path_parts.iter())
        .all(|(expected, actual)| is_wildcard(expected) || expected == actual)
}

fn is_wildcard(segment: &str) -> bool {
    segment == "*" || segment.starts_with(':')
}
