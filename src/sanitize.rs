//! Text sanitization for Author fields and Note content.
//!
//! Every string pulled out of a kind-0 or kind-1/6/11 event passes through
//! here before it reaches a cache or a projection: strip control
//! characters, collapse whitespace, trim, cap length, and discard the
//! literal string `"null"` some clients emit for an absent field.

use once_cell::sync::Lazy;
use regex::Regex;

/// Per-field maximum lengths for Author string fields. Chosen to be
/// generous enough for real-world profiles while bounding cache memory.
pub const MAX_SHORT_FIELD: usize = 255;
pub const MAX_ABOUT_FIELD: usize = 2048;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s]+").unwrap());
static HASHTAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"#(\w+)").unwrap());
static IMAGE_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(png|jpe?g|gif|webp|bmp|svg)(\?.*)?$").unwrap());

/// Strip control characters (keeping newline/tab), per spec §3 Author.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            !matches!(c, '\0' | '\x01'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F')
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text, " ").to_string()
}

/// Sanitize one Author string field: strip control chars, collapse
/// internal whitespace, trim, truncate to `max_len`, and discard the
/// literal `"null"` some clients write for an absent value.
pub fn sanitize_profile_field(raw: &str, max_len: usize) -> Option<String> {
    let cleaned = collapse_whitespace(&strip_control_chars(raw));
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

/// Escape HTML entities for safe embedding in markup contexts.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Extract `#hashtag` tokens from Note content (in addition to any `t`
/// tags; callers should union both sources).
pub fn extract_hashtags(content: &str) -> Vec<String> {
    HASHTAG_PATTERN
        .captures_iter(content)
        .map(|c| c[1].to_lowercase())
        .collect()
}

/// Extract bare URLs from Note content, classified by whether they look
/// like an image (by extension).
pub fn extract_media_urls(content: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches(|c| matches!(c, '.' | ',' | ')' | '>')))
        .filter(|url| IMAGE_EXT.is_match(url))
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discards_literal_null() {
        assert_eq!(sanitize_profile_field("null", MAX_SHORT_FIELD), None);
        assert_eq!(sanitize_profile_field("NULL", MAX_SHORT_FIELD), None);
    }

    #[test]
    fn collapses_and_trims() {
        assert_eq!(
            sanitize_profile_field("  alice   bob  ", MAX_SHORT_FIELD),
            Some("alice bob".to_string())
        );
    }

    #[test]
    fn strips_control_chars() {
        assert_eq!(strip_control_chars("a\x01b\tc\nd"), "ab\tc\nd");
    }

    #[test]
    fn truncates_to_max() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_profile_field(&long, 10).unwrap().len(), 10);
    }

    #[test]
    fn extracts_hashtags_lowercased() {
        assert_eq!(
            extract_hashtags("hello #Nostr and #rust-lang"),
            vec!["nostr".to_string(), "rust".to_string()]
        );
    }

    #[test]
    fn extracts_image_urls_only() {
        let content = "see https://example.com/cat.png and https://example.com/page";
        assert_eq!(
            extract_media_urls(content),
            vec!["https://example.com/cat.png".to_string()]
        );
    }
}
