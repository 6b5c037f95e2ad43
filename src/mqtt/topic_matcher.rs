//! MQTT topic filter matching.
//!
//! Subscription filters use the two MQTT wildcards: `+` matches exactly one
//! topic segment, `#` matches the remainder of the topic (including nothing)
//! and must terminate the filter. Matching is pure and allocation-free.

/// Checks whether a concrete `topic` matches a subscription `pattern`.
///
/// Both are `/`-delimited. A literal segment must compare equal, `+` accepts
/// any single segment, and `#` accepts everything from its position onward.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            // Pattern exhausted before topic, topic exhausted before
            // pattern, or a literal mismatch.
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn literal_topics_match_exactly() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/c"));
    }

    #[test]
    fn plus_matches_exactly_one_segment() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/b/c"));
        assert!(!matches("a/+", "a"));
        assert!(matches("+/status", "dev-01/status"));
    }

    #[test]
    fn hash_matches_any_remainder() {
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn wildcards_combine() {
        assert!(matches("swissairdry/+/status", "swissairdry/dev-01/status"));
        assert!(!matches("swissairdry/+/status", "swissairdry/dev-01/telemetry"));
        assert!(matches(
            "swissairdry/devices/+/#",
            "swissairdry/devices/dev-01/config/update"
        ));
    }

    #[test]
    fn empty_segments_are_significant() {
        assert!(matches("a//b", "a//b"));
        assert!(matches("a/+/b", "a//b"));
        assert!(!matches("a//b", "a/b"));
    }
}
