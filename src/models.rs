//! Tool inputs and outputs
//!
//! Every type here is part of the MCP contract, so each derives `JsonSchema`
//! and field docs end up in the published tool schemas.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Timing attached to every response
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Response time, RFC 3339 UTC with milliseconds
    pub now_utc: String,
    /// Wall time spent in the tool, in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Envelope shared by all tools: a one-line `summary`, the payload, and [`Meta`]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// One-line outcome for display
    pub summary: String,
    pub data: T,
    pub meta: Meta,
}

/// Configured account as exposed to callers; credentials are never included
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    pub account_id: String,
    pub host: String,
    pub port: u16,
    /// Always `true`; plaintext accounts fail at connect time
    pub secure: bool,
}

/// Entry of `imap_list_mailboxes`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MailboxInfo {
    /// Decoded mailbox name, usable as-is in other tools
    pub name: String,
    /// Hierarchy separator reported by the server (`/`, `.`), if any
    pub delimiter: Option<String>,
}

/// One search hit
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageSummary {
    /// Locator to pass to the message tools, valid while the mailbox keeps its UIDVALIDITY
    pub message_id: String,
    /// Display URI for the message
    pub message_uri: String,
    /// Display URI for the raw source
    pub message_raw_uri: String,
    pub mailbox: String,
    /// Snapshot the `uid` belongs to
    pub uidvalidity: u32,
    pub uid: u32,
    pub date: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    /// Server flags such as `Seen` or `Flagged`
    pub flags: Option<Vec<String>>,
    /// Subject preview, present only with `include_snippet=true`
    pub snippet: Option<String>,
}

/// Curated headers, flags and size for one message
///
/// Returned by `imap_get_message` after the mailbox snapshot in the locator
/// has been re-verified.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageDetail {
    pub message_id: String,
    pub message_uri: String,
    pub message_raw_uri: String,
    pub mailbox: String,
    pub uidvalidity: u32,
    pub uid: u32,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// Server flags such as `Seen` or `Flagged`
    pub flags: Vec<String>,
    /// RFC822 size reported by the server
    pub size_bytes: Option<u32>,
}

/// One page of search results, from a fresh search or a cursor resume
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchPage {
    pub account_id: String,
    pub mailbox: String,
    /// Snapshot every `message_id` on the page was issued under
    pub uidvalidity: u32,
    /// Total matches of the original search
    pub total: usize,
    /// Newest first
    pub messages: Vec<MessageSummary>,
    /// Pass back as `cursor`, with no filters, to get the next page
    pub next_cursor: Option<String>,
    /// Matches remain beyond this page, even when pagination is disabled
    pub has_more: bool,
    /// `true` when the search matched more messages than can be paged
    pub pagination_disabled: bool,
    /// Explanation shown when `pagination_disabled` is set
    pub pagination_disabled_reason: Option<String>,
}

/// Input of `imap_list_mailboxes`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountOnlyInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
}

/// Input of `imap_search_messages`
///
/// Either filters (all optional; none means every message) or a `cursor`
/// from a previous page. Sending both is rejected.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchMessagesInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Mailbox to search, e.g. `INBOX`
    pub mailbox: String,
    /// `next_cursor` from the previous page; excludes every filter
    pub cursor: Option<String>,
    /// Full-text match on headers and body
    pub query: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    /// Only messages without `\Seen`
    pub unread_only: Option<bool>,
    /// Received within the last N days (1..365); excludes the date range
    pub last_days: Option<u16>,
    /// Inclusive lower bound, `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// Inclusive upper bound, `YYYY-MM-DD`
    pub end_date: Option<String>,
    /// Page size, 1..50 (default 10)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Add a subject preview to each hit
    #[serde(default)]
    pub include_snippet: bool,
    /// Preview length, 50..500; only with `include_snippet=true`
    pub snippet_max_chars: Option<usize>,
}

/// Input of `imap_get_message`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetMessageInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search: `imap:{account}:{mailbox}:{uidvalidity}:{uid}`
    pub message_id: String,
}

/// Input of `imap_get_message_raw`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetMessageRawInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search
    pub message_id: String,
    /// Refuse messages larger than this, 1024..1000000 (default 200000)
    #[serde(default = "default_raw_max_bytes")]
    pub max_bytes: usize,
}

/// Input of `imap_update_message_flags`; at least one list must be non-empty
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateMessageFlagsInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search
    pub message_id: String,
    /// Flags to set, e.g. `\Seen`, `\Flagged`, `$Label1`
    pub add_flags: Option<Vec<String>>,
    /// Flags to clear
    pub remove_flags: Option<Vec<String>>,
}

/// Input of `imap_copy_message`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CopyMessageInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search
    pub message_id: String,
    pub destination_mailbox: String,
    /// Copy into another configured account (uses APPEND); same account when omitted
    pub destination_account_id: Option<String>,
}

/// Input of `imap_move_message`; same-account only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MoveMessageInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search
    pub message_id: String,
    pub destination_mailbox: String,
}

/// Input of `imap_delete_message`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteMessageInput {
    /// Account to use; `default` when omitted
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Locator as returned by a search
    pub message_id: String,
    /// Must be `true`
    pub confirm: bool,
}

pub fn default_account_id() -> String {
    "default".to_owned()
}

fn default_limit() -> usize {
    10
}

fn default_raw_max_bytes() -> usize {
    200_000
}
