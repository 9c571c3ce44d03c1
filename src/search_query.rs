//! Search input validation and IMAP `SEARCH` query building
//!
//! A search call is either fresh (filters, possibly none) or a cursor resume
//! (no filters at all). Mixing the two is rejected rather than resolved.

use chrono::{Duration as ChronoDuration, NaiveDate};

use crate::errors::{AppError, AppResult};
use crate::models::SearchMessagesInput;

/// Maximum messages per search result page
pub const MAX_SEARCH_LIMIT: usize = 50;
/// Default snippet length when `include_snippet` is set without a limit
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 200;

const MAX_TEXT_LEN: usize = 256;

/// Whether any filter field is present on the input
pub fn has_filters(input: &SearchMessagesInput) -> bool {
    input.query.is_some()
        || input.from.is_some()
        || input.to.is_some()
        || input.subject.is_some()
        || input.unread_only.is_some()
        || input.last_days.is_some()
        || input.start_date.is_some()
        || input.end_date.is_some()
}

/// Validate a search request before any network work
pub fn validate_search_input(input: &SearchMessagesInput) -> AppResult<()> {
    validate_range(input.limit, 1, MAX_SEARCH_LIMIT, "limit")?;

    if input.cursor.is_some() && has_filters(input) {
        return Err(AppError::invalid(
            "cursor cannot be combined with search criteria; omit filters when resuming",
        ));
    }
    if let Some(cursor) = &input.cursor
        && (cursor.is_empty() || cursor.len() > 128)
    {
        return Err(AppError::invalid("cursor must be 1..128 characters"));
    }

    if let Some(days) = input.last_days
        && !(1..=365).contains(&days)
    {
        return Err(AppError::invalid("last_days must be in range 1..365"));
    }
    if let Some(max) = input.snippet_max_chars {
        validate_range(max, 50, 500, "snippet_max_chars")?;
        if !input.include_snippet {
            return Err(AppError::invalid(
                "snippet_max_chars requires include_snippet=true",
            ));
        }
    }

    for text in [&input.query, &input.from, &input.to, &input.subject]
        .into_iter()
        .flatten()
    {
        validate_search_text(text)?;
    }

    if input.last_days.is_some() && (input.start_date.is_some() || input.end_date.is_some()) {
        return Err(AppError::invalid(
            "last_days cannot be combined with start_date/end_date",
        ));
    }
    let start = input.start_date.as_deref().map(parse_ymd).transpose()?;
    let end = input.end_date.as_deref().map(parse_ymd).transpose()?;
    if let (Some(start), Some(end)) = (start, end)
        && start > end
    {
        return Err(AppError::invalid("start_date must be <= end_date"));
    }

    Ok(())
}

/// Build the `UID SEARCH` criteria for a fresh search
///
/// `today` anchors `last_days`. Returns `ALL` when no filter is set.
pub fn build_search_query(input: &SearchMessagesInput, today: NaiveDate) -> AppResult<String> {
    let mut criteria = Vec::new();
    let text_filters = [
        ("TEXT", &input.query),
        ("FROM", &input.from),
        ("TO", &input.to),
        ("SUBJECT", &input.subject),
    ];
    for (key, value) in text_filters {
        if let Some(value) = value {
            criteria.push(format!("{key} {}", quote_imap(value)?));
        }
    }
    if input.unread_only == Some(true) {
        criteria.push("UNSEEN".to_owned());
    }
    if let Some(days) = input.last_days {
        let since = today - ChronoDuration::days(i64::from(days));
        criteria.push(format!("SINCE {}", imap_date(since)));
    }
    if let Some(start) = &input.start_date {
        criteria.push(format!("SINCE {}", imap_date(parse_ymd(start)?)));
    }
    if let Some(end) = &input.end_date {
        // BEFORE is exclusive; end_date is inclusive.
        let day_after = parse_ymd(end)? + ChronoDuration::days(1);
        criteria.push(format!("BEFORE {}", imap_date(day_after)));
    }

    if criteria.is_empty() {
        Ok("ALL".to_owned())
    } else {
        Ok(criteria.join(" "))
    }
}

/// Validate a numeric field against an inclusive range
pub fn validate_range(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

/// Reject ASCII control characters in values interpolated into IMAP commands
pub fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn validate_search_text(text: &str) -> AppResult<()> {
    if text.is_empty() || text.len() > MAX_TEXT_LEN {
        return Err(AppError::invalid(
            "search text fields must be 1..256 chars",
        ));
    }
    validate_no_controls(text, "search text")
}

/// Quote a value as an IMAP quoted string
fn quote_imap(text: &str) -> AppResult<String> {
    validate_search_text(text)?;
    Ok(format!(
        "\"{}\"",
        text.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}

/// IMAP SEARCH date, e.g. `1-Jan-2025`
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

fn parse_ymd(input: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| AppError::InvalidInput(format!("invalid date '{input}', expected YYYY-MM-DD")))
}
