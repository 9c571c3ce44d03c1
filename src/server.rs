//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the MCP tools. Every
//! handler that touches a message goes through the same sequence: parse and
//! check the message id or cursor (no network), connect, open the mailbox
//! through the snapshot guard with the embedded UIDVALIDITY, then act.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{AccountConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::headers;
use crate::imap::{ImapConnection, SearchSession};
use crate::message_id::MessageId;
use crate::models::{
    AccountInfo, AccountOnlyInput, CopyMessageInput, DeleteMessageInput, GetMessageInput,
    GetMessageRawInput, MailboxInfo, MessageDetail, MessageSummary, Meta, MoveMessageInput,
    SearchMessagesInput, SearchPage, ToolEnvelope, UpdateMessageFlagsInput,
};
use crate::pagination::{CursorStore, NewCursor, SearchCursor};
use crate::search_query::{
    self, DEFAULT_SNIPPET_MAX_CHARS, MAX_SEARCH_LIMIT, validate_no_controls, validate_range,
};
use crate::snapshot::{AccessMode, MailboxLock, MailboxLocks};
use crate::uid_set;

/// Tool name recorded on cursors; a cursor is only valid for this tool
const SEARCH_TOOL: &str = "imap_search_messages";
/// Maximum mailboxes returned by `imap_list_mailboxes`
const MAX_LISTED_MAILBOXES: usize = 200;

/// IMAP MCP server
///
/// Holds shared configuration, the cursor store and the mailbox lock
/// registry. One instance per process; clones share all three.
#[derive(Clone)]
pub struct MailImapServer {
    /// Server config (accounts, timeouts, write flag, pagination limits)
    config: Arc<ServerConfig>,
    /// Cursor store for search pagination (protected by mutex)
    cursors: Arc<Mutex<CursorStore>>,
    /// Per-mailbox locks taken by the snapshot guard
    mailbox_locks: Arc<MailboxLocks>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailImapServer {
    /// Create a new MCP server instance
    pub fn new(config: ServerConfig) -> Self {
        let cursor_store = CursorStore::new(config.cursor_ttl_ms, config.cursor_max_entries);
        Self {
            config: Arc::new(config),
            cursors: Arc::new(Mutex::new(cursor_store)),
            mailbox_locks: Arc::new(MailboxLocks::new()),
            tool_router: Self::tool_router(),
        }
    }

    /// Configured accounts, without credentials
    #[tool(
        name = "imap_list_accounts",
        description = "List configured IMAP accounts (no credentials)"
    )]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Vec<AccountInfo>>>, ErrorData> {
        let started = Instant::now();
        let accounts: Vec<AccountInfo> = self
            .config
            .accounts
            .values()
            .map(|account| AccountInfo {
                account_id: account.account_id.clone(),
                host: account.host.clone(),
                port: account.port,
                secure: account.secure,
            })
            .collect();
        respond(started, Ok(accounts), |data| {
            format!("{} account(s) configured", data.len())
        })
    }

    #[tool(
        name = "imap_list_mailboxes",
        description = "List mailbox names of an account"
    )]
    async fn list_mailboxes(
        &self,
        Parameters(input): Parameters<AccountOnlyInput>,
    ) -> Result<Json<ToolEnvelope<Vec<MailboxInfo>>>, ErrorData> {
        let started = Instant::now();
        let result = self.list_mailboxes_impl(input).await;
        respond(started, result, |data| format!("{} mailbox(es)", data.len()))
    }

    /// Search, or continue a previous search
    ///
    /// A fresh search compresses matching UIDs into ranges and stores them in
    /// a cursor when more than one page matched. Resuming with `cursor`
    /// re-validates the mailbox snapshot before slicing the next page.
    #[tool(
        name = "imap_search_messages",
        description = "Search messages with cursor pagination; pass next_cursor back alone to get the next page"
    )]
    async fn search_messages(
        &self,
        Parameters(input): Parameters<SearchMessagesInput>,
    ) -> Result<Json<ToolEnvelope<SearchPage>>, ErrorData> {
        let started = Instant::now();
        let result = self.search_messages_impl(input).await;
        respond(started, result, |page| {
            let mut summary = format!(
                "{} of {} message(s) returned",
                page.messages.len(),
                page.total
            );
            if page.pagination_disabled {
                summary.push_str("; pagination disabled");
            }
            summary
        })
    }

    #[tool(
        name = "imap_get_message",
        description = "Get headers, flags and size of one message"
    )]
    async fn get_message(
        &self,
        Parameters(input): Parameters<GetMessageInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.get_message_impl(input).await;
        respond(started, result, |_| "Message retrieved".to_owned())
    }

    #[tool(
        name = "imap_get_message_raw",
        description = "Get the RFC822 source of one message, bounded by max_bytes"
    )]
    async fn get_message_raw(
        &self,
        Parameters(input): Parameters<GetMessageRawInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.get_message_raw_impl(input).await;
        respond(started, result, |_| "Raw message retrieved".to_owned())
    }

    /// Requires `MAIL_IMAP_WRITE_ENABLED=true`.
    #[tool(
        name = "imap_update_message_flags",
        description = "Add or remove IMAP flags on one message"
    )]
    async fn update_message_flags(
        &self,
        Parameters(input): Parameters<UpdateMessageFlagsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.update_flags_impl(input).await;
        respond(started, result, |_| "Flags updated".to_owned())
    }

    /// Same-account copy uses `UID COPY`, cross-account copy uses `APPEND`.
    /// Requires `MAIL_IMAP_WRITE_ENABLED=true`.
    #[tool(
        name = "imap_copy_message",
        description = "Copy one message to a mailbox, optionally in another account"
    )]
    async fn copy_message(
        &self,
        Parameters(input): Parameters<CopyMessageInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.copy_message_impl(input).await;
        respond(started, result, |_| "Message copied".to_owned())
    }

    /// `UID MOVE` when advertised, else COPY + `\Deleted` + `UID EXPUNGE`.
    /// Requires `MAIL_IMAP_WRITE_ENABLED=true`.
    #[tool(
        name = "imap_move_message",
        description = "Move one message to another mailbox of the same account"
    )]
    async fn move_message(
        &self,
        Parameters(input): Parameters<MoveMessageInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.move_message_impl(input).await;
        respond(started, result, |_| "Message moved".to_owned())
    }

    /// Requires `confirm=true` and `MAIL_IMAP_WRITE_ENABLED=true`.
    #[tool(
        name = "imap_delete_message",
        description = "Permanently delete one message (confirm=true required)"
    )]
    async fn delete_message(
        &self,
        Parameters(input): Parameters<DeleteMessageInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.delete_message_impl(input).await;
        respond(started, result, |_| "Message deleted".to_owned())
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailImapServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "IMAP MCP server. Message ids and cursors are tied to a mailbox snapshot; if a call reports a stale snapshot, search again. Write tools require MAIL_IMAP_WRITE_ENABLED=true.",
        )
    }
}

/// How a fresh search is paginated
#[derive(Debug, Clone, PartialEq, Eq)]
enum PagePlan {
    /// Everything fits on the first page
    SinglePage,
    /// More pages follow; a cursor is stored
    Cursor,
    /// Too many matches to keep; first page only, no cursor
    Disabled { reason: String },
}

fn plan_fresh_search(total: usize, page_len: usize, max_matches: usize) -> PagePlan {
    if total > max_matches {
        PagePlan::Disabled {
            reason: format!(
                "search matched {total} messages, above the pagination limit of {max_matches}; only the first page is returned, narrow the filters to page through results"
            ),
        }
    } else if page_len < total {
        PagePlan::Cursor
    } else {
        PagePlan::SinglePage
    }
}

/// Look up a cursor for a resume request and check it belongs to the caller
///
/// Runs before any network work. Exhausted cursors are deleted.
fn checkout_cursor(
    store: &mut CursorStore,
    cursor_id: &str,
    account_id: &str,
    mailbox: &str,
) -> AppResult<SearchCursor> {
    let cursor = store
        .get(cursor_id)
        .ok_or(AppError::CursorNotFoundOrExpired)?;
    if cursor.tool != SEARCH_TOOL {
        warn!(cursor = cursor_id, tool = %cursor.tool, "cursor presented to wrong tool");
        return Err(AppError::CursorAccountMismatch(format!(
            "cursor was issued by {}",
            cursor.tool
        )));
    }
    if cursor.account_id != account_id || cursor.mailbox != mailbox {
        warn!(
            cursor = cursor_id,
            requested_account = account_id,
            requested_mailbox = mailbox,
            "cursor presented for a different account/mailbox"
        );
        return Err(AppError::CursorAccountMismatch(
            "cursor was issued for a different account or mailbox".to_owned(),
        ));
    }
    if cursor.offset >= cursor.total {
        store.delete(cursor_id);
        return Err(AppError::CursorNotFoundOrExpired);
    }
    Ok(cursor)
}

/// Move a cursor past the page just served
///
/// Returns the id to hand back, or `None` once every match was served (the
/// cursor is then deleted). A cursor that vanished while matches remain is
/// an error, so the caller restarts instead of seeing a short result.
fn advance_cursor(
    store: &mut CursorStore,
    cursor: &SearchCursor,
    next_offset: usize,
) -> AppResult<Option<String>> {
    if next_offset >= cursor.total {
        store.delete(&cursor.id);
        return Ok(None);
    }
    match store.update(&cursor.id, next_offset) {
        Some(updated) => Ok(Some(updated.id)),
        None => {
            warn!(cursor = %cursor.id, next_offset, total = cursor.total, "cursor expired mid-page");
            Err(AppError::CursorNotFoundOrExpired)
        }
    }
}

/// Tool implementation methods
impl MailImapServer {
    async fn list_mailboxes_impl(&self, input: AccountOnlyInput) -> AppResult<Vec<MailboxInfo>> {
        validate_account_id(&input.account_id)?;
        let account = self.config.get_account(&input.account_id)?;
        let mut conn = ImapConnection::connect(&self.config, account).await?;

        Ok(conn
            .list_mailboxes()
            .await?
            .into_iter()
            .take(MAX_LISTED_MAILBOXES)
            .map(|item| MailboxInfo {
                name: item.name,
                delimiter: item.delimiter,
            })
            .collect())
    }

    async fn search_messages_impl(&self, input: SearchMessagesInput) -> AppResult<SearchPage> {
        search_query::validate_search_input(&input)?;
        validate_account_id(&input.account_id)?;
        validate_mailbox(&input.mailbox)?;
        let account = self.config.get_account(&input.account_id)?;
        let limit = input.limit.clamp(1, MAX_SEARCH_LIMIT);

        match input.cursor.as_deref() {
            Some(cursor_id) => self.resume_search(account, &input, cursor_id, limit).await,
            None => self.start_search(account, &input, limit).await,
        }
    }

    async fn start_search(
        &self,
        account: &AccountConfig,
        input: &SearchMessagesInput,
        limit: usize,
    ) -> AppResult<SearchPage> {
        let query = search_query::build_search_query(input, Utc::now().date_naive())?;
        let mut conn = ImapConnection::connect(&self.config, account).await?;
        self.first_page(&mut conn, input, &query, limit).await
    }

    async fn resume_search(
        &self,
        account: &AccountConfig,
        input: &SearchMessagesInput,
        cursor_id: &str,
        limit: usize,
    ) -> AppResult<SearchPage> {
        let cursor = {
            let mut store = self.cursors.lock().await;
            checkout_cursor(&mut store, cursor_id, &input.account_id, &input.mailbox)?
        };

        let mut conn = ImapConnection::connect(&self.config, account).await?;
        self.next_page(&mut conn, cursor, limit).await
    }

    /// Run a fresh search on an open session and plan its pagination
    async fn first_page<S>(
        &self,
        session: &mut S,
        input: &SearchMessagesInput,
        query: &str,
        limit: usize,
    ) -> AppResult<SearchPage>
    where
        S: SearchSession + Send,
    {
        let include_snippet = input.include_snippet;
        let snippet_max_chars = input
            .snippet_max_chars
            .unwrap_or(DEFAULT_SNIPPET_MAX_CHARS);

        let lock = self
            .mailbox_locks
            .open(
                session,
                &input.account_id,
                &input.mailbox,
                AccessMode::ReadOnly,
                None,
            )
            .await?;
        let uidvalidity = lock.uidvalidity();

        let uid_ranges = uid_set::compress(session.uid_search(query).await?);
        let total = uid_set::total_len(&uid_ranges);
        let page_uids = uid_set::slice(&uid_ranges, 0, limit);
        debug!(
            mailbox = %input.mailbox,
            total,
            ranges = uid_ranges.len(),
            "search completed"
        );

        let messages = build_message_summaries(
            session,
            &page_uids,
            SummaryBuildOptions {
                account_id: &input.account_id,
                mailbox: &input.mailbox,
                uidvalidity,
                include_snippet,
                snippet_max_chars,
            },
        )
        .await?;
        drop(lock);

        let plan = plan_fresh_search(total, page_uids.len(), self.config.pagination_max_matches);
        let (next_cursor, pagination_disabled_reason) = match plan {
            PagePlan::SinglePage => (None, None),
            PagePlan::Disabled { reason } => {
                warn!(mailbox = %input.mailbox, total, "pagination disabled for oversized search");
                (None, Some(reason))
            }
            PagePlan::Cursor => {
                let mut store = self.cursors.lock().await;
                let cursor = store.create(NewCursor {
                    tool: SEARCH_TOOL.to_owned(),
                    account_id: input.account_id.clone(),
                    mailbox: input.mailbox.clone(),
                    uidvalidity,
                    uid_ranges,
                    offset: page_uids.len(),
                    total,
                    include_snippet,
                    snippet_max_chars,
                });
                debug!(active_cursors = store.entry_count(), "cursor stored");
                (Some(cursor.id), None)
            }
        };

        Ok(SearchPage {
            account_id: input.account_id.clone(),
            mailbox: input.mailbox.clone(),
            uidvalidity,
            total,
            messages,
            has_more: page_uids.len() < total,
            next_cursor,
            pagination_disabled: pagination_disabled_reason.is_some(),
            pagination_disabled_reason,
        })
    }

    /// Serve the next page of a checked-out cursor
    ///
    /// A changed UIDVALIDITY deletes the cursor before the error is returned.
    async fn next_page<S>(
        &self,
        session: &mut S,
        cursor: SearchCursor,
        limit: usize,
    ) -> AppResult<SearchPage>
    where
        S: SearchSession + Send,
    {
        let opened = self
            .mailbox_locks
            .open(
                session,
                &cursor.account_id,
                &cursor.mailbox,
                AccessMode::ReadOnly,
                Some(cursor.uidvalidity),
            )
            .await;
        let lock = match opened {
            Ok(lock) => lock,
            Err(e @ AppError::StaleMailboxSnapshot { .. }) => {
                self.cursors.lock().await.delete(&cursor.id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let page_uids = uid_set::slice(&cursor.uid_ranges, cursor.offset, limit);
        let messages = build_message_summaries(
            session,
            &page_uids,
            SummaryBuildOptions {
                account_id: &cursor.account_id,
                mailbox: &cursor.mailbox,
                uidvalidity: lock.uidvalidity(),
                include_snippet: cursor.include_snippet,
                snippet_max_chars: cursor.snippet_max_chars,
            },
        )
        .await?;
        drop(lock);

        let next_offset = cursor.offset + page_uids.len();
        let next_cursor = {
            let mut store = self.cursors.lock().await;
            advance_cursor(&mut store, &cursor, next_offset)?
        };

        Ok(SearchPage {
            account_id: cursor.account_id,
            mailbox: cursor.mailbox,
            uidvalidity: cursor.uidvalidity,
            total: cursor.total,
            messages,
            has_more: next_cursor.is_some(),
            next_cursor,
            pagination_disabled: false,
            pagination_disabled_reason: None,
        })
    }

    /// Parse a message id, connect, and open its mailbox under the snapshot
    /// the id was issued against
    ///
    /// Id-shape and account errors are returned before connecting.
    async fn open_message(
        &self,
        account_id: &str,
        message_id: &str,
        mode: AccessMode,
    ) -> AppResult<(MessageId, ImapConnection, MailboxLock)> {
        validate_account_id(account_id)?;
        let msg_id = parse_and_validate_message_id(account_id, message_id)?;
        let account = self.config.get_account(account_id)?;

        let mut conn = ImapConnection::connect(&self.config, account).await?;
        let lock = self
            .mailbox_locks
            .open(
                &mut conn,
                account_id,
                &msg_id.mailbox,
                mode,
                Some(msg_id.uidvalidity),
            )
            .await?;
        Ok((msg_id, conn, lock))
    }

    async fn get_message_impl(&self, input: GetMessageInput) -> AppResult<serde_json::Value> {
        let (msg_id, mut conn, _lock) = self
            .open_message(&input.account_id, &input.message_id, AccessMode::ReadOnly)
            .await?;

        let fetched = conn.fetch_headers(msg_id.uid).await?;
        let parsed = headers::parse_header_summary(&fetched.header_bytes)?;
        let (message_uri, message_raw_uri) = message_uris(&msg_id);
        let detail = MessageDetail {
            message_id: msg_id.encode(),
            message_uri,
            message_raw_uri,
            mailbox: msg_id.mailbox.clone(),
            uidvalidity: msg_id.uidvalidity,
            uid: msg_id.uid,
            date: parsed.date,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            subject: parsed.subject,
            flags: fetched.flags,
            size_bytes: fetched.size_bytes,
        };

        Ok(serde_json::json!({
            "account_id": input.account_id,
            "message": detail,
        }))
    }

    async fn get_message_raw_impl(
        &self,
        input: GetMessageRawInput,
    ) -> AppResult<serde_json::Value> {
        validate_range(input.max_bytes, 1_024, 1_000_000, "max_bytes")?;
        let (msg_id, mut conn, _lock) = self
            .open_message(&input.account_id, &input.message_id, AccessMode::ReadOnly)
            .await?;

        let raw = conn.fetch_raw_message(msg_id.uid).await?;
        if raw.len() > input.max_bytes {
            return Err(AppError::InvalidInput(
                "message exceeds max_bytes; increase max_bytes".to_owned(),
            ));
        }

        let (message_uri, message_raw_uri) = message_uris(&msg_id);
        Ok(serde_json::json!({
            "account_id": input.account_id,
            "message_id": msg_id.encode(),
            "message_uri": message_uri,
            "message_raw_uri": message_raw_uri,
            "size_bytes": raw.len(),
            "raw_source": String::from_utf8_lossy(&raw),
        }))
    }

    async fn update_flags_impl(
        &self,
        input: UpdateMessageFlagsInput,
    ) -> AppResult<serde_json::Value> {
        require_write_enabled(&self.config)?;
        let add_flags = input.add_flags.unwrap_or_default();
        let remove_flags = input.remove_flags.unwrap_or_default();
        if add_flags.is_empty() && remove_flags.is_empty() {
            return Err(AppError::invalid(
                "at least one of add_flags/remove_flags is required",
            ));
        }
        validate_flags(&add_flags, "add_flags")?;
        validate_flags(&remove_flags, "remove_flags")?;

        let (msg_id, mut conn, _lock) = self
            .open_message(&input.account_id, &input.message_id, AccessMode::ReadWrite)
            .await?;

        for (sign, flags) in [('+', &add_flags), ('-', &remove_flags)] {
            if !flags.is_empty() {
                let query = format!("{sign}FLAGS.SILENT ({})", flags.join(" "));
                conn.uid_store(msg_id.uid, &query).await?;
            }
        }

        let flags = conn.fetch_flags(msg_id.uid).await?;
        Ok(serde_json::json!({
            "account_id": input.account_id,
            "message_id": msg_id.encode(),
            "flags": flags,
        }))
    }

    async fn copy_message_impl(&self, input: CopyMessageInput) -> AppResult<serde_json::Value> {
        require_write_enabled(&self.config)?;
        validate_mailbox(&input.destination_mailbox)?;
        let destination_account_id = input
            .destination_account_id
            .clone()
            .unwrap_or_else(|| input.account_id.clone());
        validate_account_id(&destination_account_id)?;

        let msg_id = if destination_account_id == input.account_id {
            let (msg_id, mut conn, _lock) = self
                .open_message(&input.account_id, &input.message_id, AccessMode::ReadWrite)
                .await?;
            conn.uid_copy(msg_id.uid, &input.destination_mailbox)
                .await?;
            msg_id
        } else {
            let destination = self.config.get_account(&destination_account_id)?;
            // Source lock is released before the destination is contacted.
            let (msg_id, raw) = {
                let (msg_id, mut conn, _lock) = self
                    .open_message(&input.account_id, &input.message_id, AccessMode::ReadOnly)
                    .await?;
                let raw = conn.fetch_raw_message(msg_id.uid).await?;
                (msg_id, raw)
            };

            let mut destination_conn = ImapConnection::connect(&self.config, destination).await?;
            destination_conn
                .append(&input.destination_mailbox, &raw)
                .await?;
            msg_id
        };

        Ok(serde_json::json!({
            "source_account_id": input.account_id,
            "destination_account_id": destination_account_id,
            "source_mailbox": msg_id.mailbox,
            "destination_mailbox": input.destination_mailbox,
            "message_id": msg_id.encode(),
            "new_message_id": serde_json::Value::Null,
        }))
    }

    async fn move_message_impl(&self, input: MoveMessageInput) -> AppResult<serde_json::Value> {
        require_write_enabled(&self.config)?;
        validate_mailbox(&input.destination_mailbox)?;

        let (msg_id, mut conn, _lock) = self
            .open_message(&input.account_id, &input.message_id, AccessMode::ReadWrite)
            .await?;

        if conn.capabilities().await?.has_str("MOVE") {
            conn.uid_move(msg_id.uid, &input.destination_mailbox)
                .await?;
        } else {
            conn.uid_copy(msg_id.uid, &input.destination_mailbox)
                .await?;
            conn.uid_store(msg_id.uid, "+FLAGS.SILENT (\\Deleted)")
                .await?;
            conn.uid_expunge(msg_id.uid).await?;
        }

        Ok(serde_json::json!({
            "account_id": input.account_id,
            "source_mailbox": msg_id.mailbox,
            "destination_mailbox": input.destination_mailbox,
            "message_id": msg_id.encode(),
            "new_message_id": serde_json::Value::Null,
        }))
    }

    async fn delete_message_impl(&self, input: DeleteMessageInput) -> AppResult<serde_json::Value> {
        require_write_enabled(&self.config)?;
        if !input.confirm {
            return Err(AppError::invalid("delete requires confirm=true"));
        }

        let (msg_id, mut conn, _lock) = self
            .open_message(&input.account_id, &input.message_id, AccessMode::ReadWrite)
            .await?;
        conn.uid_store(msg_id.uid, "+FLAGS.SILENT (\\Deleted)")
            .await?;
        conn.uid_expunge(msg_id.uid).await?;

        Ok(serde_json::json!({
            "account_id": input.account_id,
            "mailbox": msg_id.mailbox,
            "message_id": msg_id.encode(),
        }))
    }
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Wrap a handler result in the response envelope, or map its error
fn respond<T>(
    started: Instant,
    result: AppResult<T>,
    summarize: impl FnOnce(&T) -> String,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok(data) => Ok(Json(ToolEnvelope {
            summary: summarize(&data),
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => {
            warn!(code = e.code(), error = %e, "tool call failed");
            Err(e.to_error_data())
        }
    }
}

/// Parse message_id, validate mailbox, and enforce account_id match
fn parse_and_validate_message_id(account_id: &str, message_id: &str) -> AppResult<MessageId> {
    let msg_id = MessageId::parse(message_id)?;
    if validate_mailbox(&msg_id.mailbox).is_err() {
        return Err(AppError::invalid_message_id(
            "message_id mailbox is not a valid mailbox name",
        ));
    }
    if msg_id.account_id != account_id {
        return Err(AppError::AccountMismatch(format!(
            "message_id belongs to account '{}', not '{account_id}'",
            msg_id.account_id
        )));
    }
    Ok(msg_id)
}

struct SummaryBuildOptions<'a> {
    account_id: &'a str,
    mailbox: &'a str,
    uidvalidity: u32,
    include_snippet: bool,
    snippet_max_chars: usize,
}

/// Fetch one page of summaries in a single `UID FETCH`, keeping page order
///
/// UIDs expunged since the search are skipped.
async fn build_message_summaries<S>(
    session: &mut S,
    uids: &[u32],
    options: SummaryBuildOptions<'_>,
) -> AppResult<Vec<MessageSummary>>
where
    S: SearchSession + Send,
{
    let mut fetched = session
        .fetch_headers_batch(&uid_set::to_sequence_set(uids))
        .await?;

    let mut messages = Vec::with_capacity(uids.len());
    for &uid in uids {
        let Some(message) = fetched.remove(&uid) else {
            debug!(uid, "uid vanished between search and fetch");
            continue;
        };
        let parsed = headers::parse_header_summary(&message.header_bytes)?;
        let snippet = if options.include_snippet {
            parsed
                .subject
                .clone()
                .map(|s| headers::truncate_chars(s, options.snippet_max_chars))
        } else {
            None
        };

        let msg_id = MessageId {
            account_id: options.account_id.to_owned(),
            mailbox: options.mailbox.to_owned(),
            uidvalidity: options.uidvalidity,
            uid,
        };
        let (message_uri, message_raw_uri) = message_uris(&msg_id);
        messages.push(MessageSummary {
            message_id: msg_id.encode(),
            message_uri,
            message_raw_uri,
            mailbox: msg_id.mailbox,
            uidvalidity: options.uidvalidity,
            uid,
            date: parsed.date,
            from: parsed.from,
            subject: parsed.subject,
            flags: Some(message.flags),
            snippet,
        });
    }
    Ok(messages)
}

/// Validate account_id format
///
/// Restricting to `[A-Za-z0-9_-]` keeps the message id delimiter out of
/// account ids.
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::invalid("account_id must be 1..64 characters"));
    }
    if !account_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::invalid("account_id must match [A-Za-z0-9_-]+"));
    }
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::invalid("mailbox must be 1..256 characters"));
    }
    validate_no_controls(mailbox, "mailbox")
}

fn validate_flags(flags: &[String], field: &str) -> AppResult<()> {
    match flags.iter().find(|flag| !is_valid_flag(flag)) {
        Some(flag) => Err(AppError::InvalidInput(format!(
            "{field} contains invalid flag '{flag}'; flags must not contain whitespace, control chars, quotes, parentheses, or braces"
        ))),
        None => Ok(()),
    }
}

/// System flag (`\Seen`) or keyword atom (`$Label1`), never a command fragment
fn is_valid_flag(flag: &str) -> bool {
    if flag.is_empty() || flag.len() > 64 {
        return false;
    }
    let atom = flag.strip_prefix('\\').unwrap_or(flag);
    !atom.is_empty()
        && !atom.chars().any(|ch| {
            ch.is_ascii_control()
                || ch.is_ascii_whitespace()
                || matches!(ch, '"' | '(' | ')' | '{' | '}' | '\\')
        })
}

fn require_write_enabled(config: &ServerConfig) -> AppResult<()> {
    if !config.write_enabled {
        return Err(AppError::invalid(
            "write tools are disabled; set MAIL_IMAP_WRITE_ENABLED=true",
        ));
    }
    Ok(())
}

/// Message and raw-source URIs for display
fn message_uris(msg_id: &MessageId) -> (String, String) {
    let uri = format!(
        "imap://{}/mailbox/{}/message/{}/{}",
        msg_id.account_id,
        urlencoding::encode(&msg_id.mailbox),
        msg_id.uidvalidity,
        msg_id.uid
    );
    let raw = format!("{uri}/raw");
    (uri, raw)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::{
        MailImapServer, PagePlan, SEARCH_TOOL, advance_cursor, checkout_cursor, is_valid_flag,
        message_uris, parse_and_validate_message_id, plan_fresh_search, validate_mailbox,
    };
    use crate::config::ServerConfig;
    use crate::errors::{AppError, AppResult};
    use crate::imap::{MessageHeaders, SearchSession};
    use crate::models::{SearchMessagesInput, SearchPage};
    use crate::pagination::tests::{ManualClock, new_cursor};
    use crate::pagination::{CursorStore, SearchCursor};
    use crate::snapshot::{AccessMode, MailboxSelector};
    use crate::uid_set;

    /// In-memory mailbox standing in for an IMAP session
    struct FakeMailbox {
        uidvalidity: u32,
        uids: Vec<u32>,
        /// Matched by search but gone by the time of the fetch
        expunged: Vec<u32>,
    }

    impl FakeMailbox {
        fn new(uidvalidity: u32, uids: impl IntoIterator<Item = u32>) -> Self {
            Self {
                uidvalidity,
                uids: uids.into_iter().collect(),
                expunged: Vec::new(),
            }
        }
    }

    impl MailboxSelector for FakeMailbox {
        async fn select_mailbox(&mut self, _mailbox: &str, _mode: AccessMode) -> AppResult<u32> {
            Ok(self.uidvalidity)
        }
    }

    impl SearchSession for FakeMailbox {
        async fn uid_search(&mut self, _query: &str) -> AppResult<Vec<u32>> {
            let mut uids = self.uids.clone();
            uids.sort_unstable_by(|a, b| b.cmp(a));
            Ok(uids)
        }

        async fn fetch_headers_batch(
            &mut self,
            _uid_set: &str,
        ) -> AppResult<HashMap<u32, MessageHeaders>> {
            Ok(self
                .uids
                .iter()
                .filter(|uid| !self.expunged.contains(uid))
                .map(|&uid| {
                    let headers = MessageHeaders {
                        header_bytes: format!("Subject: message {uid}\r\n\r\n").into_bytes(),
                        flags: Vec::new(),
                        size_bytes: Some(100),
                    };
                    (uid, headers)
                })
                .collect())
        }
    }

    fn test_server(pagination_max_matches: usize) -> (MailImapServer, Arc<ManualClock>) {
        let config = ServerConfig {
            accounts: BTreeMap::new(),
            write_enabled: false,
            connect_timeout_ms: 1_000,
            greeting_timeout_ms: 1_000,
            socket_timeout_ms: 1_000,
            cursor_ttl_ms: 60_000,
            cursor_max_entries: 16,
            pagination_max_matches,
        };
        let clock = ManualClock::new();
        let mut server = MailImapServer::new(config);
        server.cursors = Arc::new(Mutex::new(CursorStore::with_clock(
            60_000,
            16,
            clock.clone(),
        )));
        (server, clock)
    }

    fn search_input() -> SearchMessagesInput {
        serde_json::from_value(serde_json::json!({ "mailbox": "INBOX" }))
            .expect("minimal input deserializes")
    }

    fn page_uids(page: &SearchPage) -> Vec<u32> {
        page.messages.iter().map(|m| m.uid).collect()
    }

    async fn checkout(server: &MailImapServer, id: &str) -> SearchCursor {
        let mut store = server.cursors.lock().await;
        checkout_cursor(&mut store, id, "default", "INBOX").expect("cursor checks out")
    }

    fn store() -> CursorStore {
        CursorStore::with_clock(60_000, 16, ManualClock::new())
    }

    #[test]
    fn rejects_control_chars_in_mailbox() {
        let err = validate_mailbox("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn flag_validation_allows_common_flags() {
        assert!(is_valid_flag("\\Seen"));
        assert!(is_valid_flag("Important"));
        assert!(is_valid_flag("$MailFlagBit0"));
    }

    #[test]
    fn flag_validation_rejects_injection_like_value() {
        assert!(!is_valid_flag("\\Seen) UID FETCH 1:* (BODY[]"));
        assert!(!is_valid_flag("\\"));
        assert!(!is_valid_flag(""));
    }

    #[test]
    fn message_id_shape_and_account_are_validated() {
        let err = parse_and_validate_message_id("default", "imap:default:INBOX:x:1")
            .expect_err("must fail");
        assert!(matches!(err, AppError::InvalidMessageId(_)));

        let err = parse_and_validate_message_id("default", "imap:work:INBOX:1:1")
            .expect_err("must fail");
        assert!(matches!(err, AppError::AccountMismatch(_)));

        let err = parse_and_validate_message_id("default", "imap:default:IN\rBOX:1:1")
            .expect_err("must fail");
        assert!(matches!(err, AppError::InvalidMessageId(_)));

        let id = parse_and_validate_message_id("default", "imap:default:A:B:100:42")
            .expect("valid id");
        assert_eq!(id.mailbox, "A:B");
    }

    #[test]
    fn cursor_from_other_account_is_rejected() {
        let mut store = store();
        let id = store.create(new_cursor("work", "INBOX")).id;

        let err = checkout_cursor(&mut store, &id, "default", "INBOX").expect_err("must fail");
        assert!(matches!(err, AppError::CursorAccountMismatch(_)));
        let err = checkout_cursor(&mut store, &id, "work", "Archive").expect_err("must fail");
        assert!(matches!(err, AppError::CursorAccountMismatch(_)));

        // Misuse does not destroy the owner's cursor.
        let cursor = checkout_cursor(&mut store, &id, "work", "INBOX").expect("owner resumes");
        assert_eq!(cursor.account_id, "work");
    }

    #[test]
    fn cursor_from_other_tool_is_rejected() {
        let mut store = store();
        let mut entry = new_cursor("default", "INBOX");
        entry.tool = "imap_list_threads".to_owned();
        let id = store.create(entry).id;
        let err = checkout_cursor(&mut store, &id, "default", "INBOX").expect_err("must fail");
        assert!(matches!(err, AppError::CursorAccountMismatch(_)));
    }

    #[test]
    fn unknown_cursor_is_not_found() {
        let mut store = store();
        let err = checkout_cursor(&mut store, "nope", "default", "INBOX").expect_err("must fail");
        assert!(matches!(err, AppError::CursorNotFoundOrExpired));
    }

    #[test]
    fn exhausted_cursor_is_deleted() {
        let mut store = store();
        let mut entry = new_cursor("default", "INBOX");
        entry.offset = entry.total;
        let id = store.create(entry).id;

        let err = checkout_cursor(&mut store, &id, "default", "INBOX").expect_err("must fail");
        assert!(matches!(err, AppError::CursorNotFoundOrExpired));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn resumed_pages_walk_the_stored_ranges() {
        let mut store = store();
        let mut entry = new_cursor("default", "INBOX");
        entry.uid_ranges = uid_set::compress([10, 9, 8, 3, 2, 1]);
        entry.total = 6;
        entry.offset = 2;
        let id = store.create(entry).id;

        let cursor = checkout_cursor(&mut store, &id, "default", "INBOX").expect("resumes");
        assert_eq!(cursor.tool, SEARCH_TOOL);
        let page = uid_set::slice(&cursor.uid_ranges, cursor.offset, 3);
        assert_eq!(page, vec![8, 3, 2]);
        store.update(&id, cursor.offset + page.len());

        let cursor = checkout_cursor(&mut store, &id, "default", "INBOX").expect("resumes");
        assert_eq!(uid_set::slice(&cursor.uid_ranges, cursor.offset, 3), vec![1]);
    }

    #[test]
    fn pagination_plan_follows_ceiling() {
        assert_eq!(plan_fresh_search(0, 0, 100), PagePlan::SinglePage);
        assert_eq!(plan_fresh_search(10, 10, 100), PagePlan::SinglePage);
        assert_eq!(plan_fresh_search(11, 10, 100), PagePlan::Cursor);
        assert_eq!(plan_fresh_search(100, 10, 100), PagePlan::Cursor);

        let PagePlan::Disabled { reason } = plan_fresh_search(101, 10, 100) else {
            panic!("expected pagination to be disabled");
        };
        assert!(reason.contains("101"));
        assert!(reason.contains("100"));
    }

    #[test]
    fn message_uris_encode_mailbox() {
        let id = parse_and_validate_message_id("default", "imap:default:A B:1:2")
            .expect("valid id");
        let (uri, raw) = message_uris(&id);
        assert_eq!(uri, "imap://default/mailbox/A%20B/message/1/2");
        assert_eq!(raw, "imap://default/mailbox/A%20B/message/1/2/raw");
    }

    #[tokio::test]
    async fn fresh_search_pages_through_cursor_to_the_end() {
        let (server, _) = test_server(100);
        let mut mailbox = FakeMailbox::new(7, 1..=5);

        let first = server
            .first_page(&mut mailbox, &search_input(), "ALL", 2)
            .await
            .expect("first page");
        assert_eq!(page_uids(&first), vec![5, 4]);
        assert_eq!(first.total, 5);
        assert!(first.has_more);
        assert_eq!(first.messages[0].message_id, "imap:default:INBOX:7:5");
        let id = first.next_cursor.expect("cursor issued");

        let cursor = checkout(&server, &id).await;
        let second = server
            .next_page(&mut mailbox, cursor, 2)
            .await
            .expect("second page");
        assert_eq!(page_uids(&second), vec![3, 2]);
        assert_eq!(second.next_cursor.as_deref(), Some(id.as_str()));

        let cursor = checkout(&server, &id).await;
        let last = server
            .next_page(&mut mailbox, cursor, 2)
            .await
            .expect("last page");
        assert_eq!(page_uids(&last), vec![1]);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
        assert_eq!(server.cursors.lock().await.entry_count(), 0);
    }

    #[tokio::test]
    async fn single_page_search_creates_no_cursor() {
        let (server, _) = test_server(100);
        let mut mailbox = FakeMailbox::new(7, [1, 2]);

        let page = server
            .first_page(&mut mailbox, &search_input(), "ALL", 10)
            .await
            .expect("page");
        assert_eq!(page_uids(&page), vec![2, 1]);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
        assert_eq!(server.cursors.lock().await.entry_count(), 0);
    }

    #[tokio::test]
    async fn search_over_ceiling_returns_first_page_without_cursor() {
        let (server, _) = test_server(3);
        let mut mailbox = FakeMailbox::new(7, 1..=10);

        let page = server
            .first_page(&mut mailbox, &search_input(), "ALL", 2)
            .await
            .expect("page");
        assert_eq!(page_uids(&page), vec![10, 9]);
        assert_eq!(page.total, 10);
        assert!(page.pagination_disabled);
        assert!(page.pagination_disabled_reason.is_some());
        assert!(page.has_more);
        assert!(page.next_cursor.is_none());
        assert_eq!(server.cursors.lock().await.entry_count(), 0);
    }

    #[tokio::test]
    async fn stale_resume_deletes_cursor() {
        let (server, _) = test_server(100);
        let mut mailbox = FakeMailbox::new(7, 1..=5);
        let id = server
            .first_page(&mut mailbox, &search_input(), "ALL", 2)
            .await
            .expect("first page")
            .next_cursor
            .expect("cursor issued");

        mailbox.uidvalidity = 8;
        let cursor = checkout(&server, &id).await;
        let err = server
            .next_page(&mut mailbox, cursor, 2)
            .await
            .expect_err("must be stale");
        assert!(matches!(
            err,
            AppError::StaleMailboxSnapshot {
                expected: 7,
                observed: 8,
                ..
            }
        ));
        assert!(server.cursors.lock().await.get(&id).is_none());
    }

    #[tokio::test]
    async fn cursor_expiring_during_resume_is_reported() {
        let (server, clock) = test_server(100);
        let mut mailbox = FakeMailbox::new(7, 1..=5);
        let id = server
            .first_page(&mut mailbox, &search_input(), "ALL", 1)
            .await
            .expect("first page")
            .next_cursor
            .expect("cursor issued");

        let cursor = checkout(&server, &id).await;
        clock.set_ms(60_000);
        let err = server
            .next_page(&mut mailbox, cursor, 2)
            .await
            .expect_err("must not claim the results are complete");
        assert!(matches!(err, AppError::CursorNotFoundOrExpired));
    }

    #[tokio::test]
    async fn uids_expunged_after_search_are_skipped() {
        let (server, _) = test_server(100);
        let mut mailbox = FakeMailbox::new(7, 1..=3);
        mailbox.expunged.push(2);

        let page = server
            .first_page(&mut mailbox, &search_input(), "ALL", 3)
            .await
            .expect("page");
        assert_eq!(page_uids(&page), vec![3, 1]);
        assert_eq!(page.total, 3);
    }

    #[test]
    fn advancing_a_vanished_cursor_is_an_error() {
        let clock = ManualClock::new();
        let mut store = CursorStore::with_clock(1_000, 16, clock.clone());
        let mut entry = new_cursor("default", "INBOX");
        entry.offset = 1;
        let id = store.create(entry).id;
        let cursor = checkout_cursor(&mut store, &id, "default", "INBOX").expect("checks out");

        clock.set_ms(1_000);
        let err = advance_cursor(&mut store, &cursor, 3).expect_err("must fail");
        assert!(matches!(err, AppError::CursorNotFoundOrExpired));
    }

    #[test]
    fn advancing_to_the_end_deletes_cursor() {
        let mut store = store();
        let id = store.create(new_cursor("default", "INBOX")).id;
        let cursor = checkout_cursor(&mut store, &id, "default", "INBOX").expect("checks out");

        assert_eq!(
            advance_cursor(&mut store, &cursor, 3).expect("advances"),
            Some(id.clone())
        );
        assert_eq!(store.get(&id).expect("still stored").offset, 3);
        assert_eq!(advance_cursor(&mut store, &cursor, 5).expect("finishes"), None);
        assert!(store.get(&id).is_none());
    }
}
