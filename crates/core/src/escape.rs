// crates/core/src/escape.rs
//! Escaping for the catalog's searchable-message projection.
//!
//! Message text is stored in `messages_searchable` with `<` and `>` replaced
//! by the SI/SO control bytes (U+000E / U+000F) so angle-bracketed markup
//! never collides with FTS query syntax or snippet delimiters. The reader
//! reverses the mapping before display.

/// `<` is stored as U+000E (shift in).
pub const ESCAPED_LT: char = '\u{000E}';
/// `>` is stored as U+000F (shift out).
pub const ESCAPED_GT: char = '\u{000F}';

/// Escape text for storage in the searchable projection.
pub fn escape_searchable(text: &str) -> String {
    if !text.contains(['<', '>']) {
        return text.to_string();
    }
    text.chars()
        .map(|c| match c {
            '<' => ESCAPED_LT,
            '>' => ESCAPED_GT,
            other => other,
        })
        .collect()
}

/// Reverse [`escape_searchable`].
pub fn unescape_searchable(text: &str) -> String {
    if !text.contains([ESCAPED_LT, ESCAPED_GT]) {
        return text.to_string();
    }
    text.chars()
        .map(|c| match c {
            ESCAPED_LT => '<',
            ESCAPED_GT => '>',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn escapes_angle_brackets() {
        assert_eq!(escape_searchable("<tag>"), "\u{0E}tag\u{0F}");
        assert_eq!(escape_searchable("a < b > c"), "a \u{0E} b \u{0F} c");
    }

    #[test]
    fn passthrough_without_brackets() {
        assert_eq!(escape_searchable("plain text"), "plain text");
        assert_eq!(unescape_searchable("plain text"), "plain text");
    }

    #[test]
    fn round_trips_arbitrary_utf8() {
        for text in [
            "<html><body>日本語</body></html>",
            "math: 1 < 2 && 3 > 2",
            "emoji 🎉 <mixed> ascii",
            "",
            "no brackets at all",
        ] {
            assert_eq!(unescape_searchable(&escape_searchable(text)), text);
        }
    }

    #[test]
    fn control_bytes_survive_storage_shape() {
        let escaped = escape_searchable("<x>");
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('>'));
        assert!(escaped.contains(ESCAPED_LT));
        assert!(escaped.contains(ESCAPED_GT));
    }
}
