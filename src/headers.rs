//! Header parsing for message summaries
//!
//! Parses the curated header block fetched with `BODY.PEEK[HEADER.FIELDS ...]`
//! using `mailparse`, which also decodes RFC 2047 encoded words.

use mailparse::MailHeaderMap;

use crate::errors::{AppError, AppResult};

/// Curated headers of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
}

/// Parse a header block into the curated fields
///
/// Missing headers are `None`; the first occurrence wins when a header is
/// repeated. An empty block yields an empty summary.
pub fn parse_header_summary(header_bytes: &[u8]) -> AppResult<HeaderSummary> {
    if header_bytes.is_empty() {
        return Ok(HeaderSummary::default());
    }
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(HeaderSummary {
        date: headers.get_first_value("Date"),
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        cc: headers.get_first_value("Cc"),
        subject: headers.get_first_value("Subject"),
    })
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_owned(),
        None => input,
    }
}

#[cfg(test)]
mod tests {
    use super::{HeaderSummary, parse_header_summary, truncate_chars};

    #[test]
    fn truncates_unicode_by_character() {
        let input = "a😀b😀c".to_owned();
        assert_eq!(truncate_chars(input.clone(), 4), "a😀b😀");
        assert_eq!(truncate_chars(input.clone(), 50), input);
        assert_eq!(truncate_chars(input, 0), "");
    }

    #[test]
    fn parses_curated_fields_case_insensitively() {
        let raw = b"subject: Hi\r\nFROM: sender@example.com\r\nTo: user@example.com\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\n";
        let parsed = parse_header_summary(raw).expect("parse should succeed");

        assert_eq!(parsed.subject.as_deref(), Some("Hi"));
        assert_eq!(parsed.from.as_deref(), Some("sender@example.com"));
        assert_eq!(parsed.to.as_deref(), Some("user@example.com"));
        assert_eq!(parsed.cc, None);
    }

    #[test]
    fn decodes_encoded_word_subjects() {
        let raw = b"Subject: =?UTF-8?B?SGVsbG8gV2VsdA==?=\r\n\r\n";
        let parsed = parse_header_summary(raw).expect("parse should succeed");
        assert_eq!(parsed.subject.as_deref(), Some("Hello Welt"));
    }

    #[test]
    fn empty_block_is_empty_summary() {
        assert_eq!(
            parse_header_summary(b"").expect("empty is fine"),
            HeaderSummary::default()
        );
    }
}
