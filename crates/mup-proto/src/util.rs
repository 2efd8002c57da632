//! Small string helpers shared across the wire codec and command parser.

/// Truncates a string to at most `max_bytes` bytes without breaking
/// a multi-byte UTF-8 codepoint at the end.
///
/// # Examples
///
/// ```
/// use mup_proto::util::truncate_utf8_safe;
///
/// assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
///
/// let emoji = "Hello 👋 World";
/// let truncated = truncate_utf8_safe(emoji, 8);
/// assert_eq!(truncated, "Hello "); // Stops before the 4-byte emoji
///
/// assert_eq!(truncate_utf8_safe("hi", 10), "hi");
/// ```
#[inline]
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_safe_ascii() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
        assert_eq!(truncate_utf8_safe("", 5), "");
    }

    #[test]
    fn test_truncate_utf8_safe_multibyte() {
        let s = "café";
        assert_eq!(truncate_utf8_safe(s, 4), "caf");
        assert_eq!(truncate_utf8_safe(s, 5), "café");

        let s = "100€";
        assert_eq!(truncate_utf8_safe(s, 4), "100");
        assert_eq!(truncate_utf8_safe(s, 6), "100€");

        let s = "Hi👋";
        assert_eq!(truncate_utf8_safe(s, 3), "Hi");
        assert_eq!(truncate_utf8_safe(s, 6), "Hi👋");
    }

    #[test]
    fn test_truncate_utf8_safe_edge_cases() {
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 3), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
        assert_eq!(truncate_utf8_safe(s, 9), "日本語");

        assert_eq!(truncate_utf8_safe("hello", 0), "");
    }
}
