//! IMAP transport and session operations
//!
//! Wraps an `async-imap` session over TLS with per-command timeouts derived
//! from server config. Mailbox names cross the wire in modified UTF-7 and are
//! decoded back to Unicode for callers.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Capabilities, Fetch};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use utf7_imap::{decode_utf7_imap, encode_utf7_imap};

use crate::config::{AccountConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::snapshot::{AccessMode, MailboxSelector};

/// Authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Header fields fetched for search result summaries
const SUMMARY_QUERY: &str = "(UID FLAGS RFC822.SIZE BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT)])";

/// Mailbox listing entry with a decoded name
#[derive(Debug, Clone)]
pub struct ListedMailbox {
    pub name: String,
    pub delimiter: Option<String>,
}

/// Header bytes, flags and size of one message
#[derive(Debug, Clone)]
pub struct MessageHeaders {
    pub header_bytes: Vec<u8>,
    pub flags: Vec<String>,
    pub size_bytes: Option<u32>,
}

/// Session operations a search needs once the mailbox is open
pub trait SearchSession: MailboxSelector {
    /// Run `UID SEARCH`, returning matching UIDs newest first
    fn uid_search(&mut self, query: &str) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// Fetch summary headers for a page of UIDs in one `UID FETCH`
    ///
    /// `uid_set` is an IMAP sequence set. UIDs expunged since the search are
    /// simply absent from the result.
    fn fetch_headers_batch(
        &mut self,
        uid_set: &str,
    ) -> impl Future<Output = AppResult<HashMap<u32, MessageHeaders>>> + Send;
}

/// One authenticated connection with its command timeout
pub struct ImapConnection {
    session: ImapSession,
    socket_timeout: Duration,
}

/// Run an IMAP command future under `limit`, mapping both failure kinds
async fn bounded<T, E, F>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{what} timed out")))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("{what} failed: {e}"))))
}

impl ImapConnection {
    /// Connect to IMAP server and authenticate
    ///
    /// 1. TCP connect (`connect_timeout_ms`)
    /// 2. TLS handshake with webpki roots (`greeting_timeout_ms`)
    /// 3. Read IMAP greeting (`greeting_timeout_ms`)
    /// 4. LOGIN (`greeting_timeout_ms`)
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
    /// - `Timeout` if any connection phase times out
    /// - `AuthFailed` if authentication fails
    /// - `Internal` for TCP, TLS, or greeting failures
    pub async fn connect(server: &ServerConfig, account: &AccountConfig) -> AppResult<Self> {
        if !account.secure {
            return Err(AppError::InvalidInput(
                "insecure IMAP is not supported; set MAIL_IMAP_<ACCOUNT>_SECURE=true".to_owned(),
            ));
        }

        let connect_duration = Duration::from_millis(server.connect_timeout_ms);
        let greeting_duration = Duration::from_millis(server.greeting_timeout_ms);

        let tcp = bounded(
            connect_duration,
            "tcp connect",
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
        let tls_stream = bounded(
            greeting_duration,
            "TLS handshake",
            connector.connect(server_name, tcp),
        )
        .await?;

        let mut client = Client::new(tls_stream);
        let greeting = bounded(greeting_duration, "IMAP greeting", client.read_response()).await?;
        if greeting.is_none() {
            return Err(AppError::Internal(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let pass = account.pass.expose_secret();
        let session = timeout(greeting_duration, client.login(account.user.as_str(), pass))
            .await
            .map_err(|_| AppError::Timeout("IMAP login timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|(e, _)| {
                    let msg = e.to_string();
                    if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                        AppError::AuthFailed(msg)
                    } else {
                        AppError::Internal(msg)
                    }
                })
            })?;
        debug!(account_id = %account.account_id, host = %account.host, "IMAP session established");

        Ok(Self {
            session,
            socket_timeout: Duration::from_millis(server.socket_timeout_ms),
        })
    }

    /// Query server capabilities (used to detect `MOVE`)
    pub async fn capabilities(&mut self) -> AppResult<Capabilities> {
        bounded(self.socket_timeout, "CAPABILITY", self.session.capabilities()).await
    }

    /// List all visible mailboxes with names decoded from modified UTF-7
    pub async fn list_mailboxes(&mut self) -> AppResult<Vec<ListedMailbox>> {
        let limit = self.socket_timeout;
        let stream = bounded(limit, "LIST", self.session.list(None, Some("*"))).await?;
        let names: Vec<_> = bounded(limit, "LIST stream", stream.try_collect::<Vec<_>>()).await?;
        Ok(names
            .iter()
            .map(|item| ListedMailbox {
                name: decode_utf7_imap(item.name().to_owned()),
                delimiter: item.delimiter().map(|d| d.to_string()),
            })
            .collect())
    }

    /// Fetch summary headers of a single message
    ///
    /// # Errors
    ///
    /// - `NotFound` if UID does not exist in mailbox
    pub async fn fetch_headers(&mut self, uid: u32) -> AppResult<MessageHeaders> {
        let fetch = self.fetch_one(uid, SUMMARY_QUERY).await?;
        Ok(message_headers(&fetch))
    }

    /// Fetch full RFC822 message source
    pub async fn fetch_raw_message(&mut self, uid: u32) -> AppResult<Vec<u8>> {
        let fetch = self.fetch_one(uid, "UID RFC822").await?;
        let body = fetch
            .body()
            .ok_or_else(|| AppError::Internal("message has no RFC822 body".to_owned()))?;
        Ok(body.to_vec())
    }

    /// Fetch message flags only
    pub async fn fetch_flags(&mut self, uid: u32) -> AppResult<Vec<String>> {
        let fetch = self.fetch_one(uid, "UID FLAGS").await?;
        Ok(flags_to_strings(&fetch))
    }

    /// Run `UID STORE` with a flag query (`+FLAGS.SILENT (...)` etc.)
    pub async fn uid_store(&mut self, uid: u32, query: &str) -> AppResult<()> {
        let limit = self.socket_timeout;
        let stream = bounded(
            limit,
            "UID STORE",
            self.session.uid_store(uid.to_string(), query),
        )
        .await?;
        let _: Vec<Fetch> = bounded(limit, "UID STORE stream", stream.try_collect()).await?;
        Ok(())
    }

    /// Copy message to another mailbox of the same account
    pub async fn uid_copy(&mut self, uid: u32, mailbox: &str) -> AppResult<()> {
        bounded(
            self.socket_timeout,
            "UID COPY",
            self.session
                .uid_copy(uid.to_string(), encode_utf7_imap(mailbox.to_owned())),
        )
        .await
    }

    /// Move message with `UID MOVE` (RFC 6851)
    pub async fn uid_move(&mut self, uid: u32, mailbox: &str) -> AppResult<()> {
        bounded(
            self.socket_timeout,
            "UID MOVE",
            self.session
                .uid_mv(uid.to_string(), encode_utf7_imap(mailbox.to_owned())),
        )
        .await
    }

    /// Expunge one message previously marked `\Deleted`
    pub async fn uid_expunge(&mut self, uid: u32) -> AppResult<()> {
        let limit = self.socket_timeout;
        let stream = bounded(
            limit,
            "UID EXPUNGE",
            self.session.uid_expunge(uid.to_string()),
        )
        .await?;
        let _: Vec<u32> = bounded(limit, "UID EXPUNGE stream", stream.try_collect()).await?;
        Ok(())
    }

    /// Append raw RFC822 message to mailbox (cross-account copy)
    pub async fn append(&mut self, mailbox: &str, content: &[u8]) -> AppResult<()> {
        bounded(
            self.socket_timeout,
            "APPEND",
            self.session
                .append(encode_utf7_imap(mailbox.to_owned()), None, None, content),
        )
        .await
    }

    async fn uid_fetch(&mut self, uid_set: &str, query: &str) -> AppResult<Vec<Fetch>> {
        let limit = self.socket_timeout;
        let stream = bounded(limit, "UID FETCH", self.session.uid_fetch(uid_set, query)).await?;
        bounded(limit, "UID FETCH stream", stream.try_collect()).await
    }

    async fn fetch_one(&mut self, uid: u32, query: &str) -> AppResult<Fetch> {
        self.uid_fetch(&uid.to_string(), query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
    }
}

impl MailboxSelector for ImapConnection {
    /// `EXAMINE` or `SELECT`, returning UIDVALIDITY
    async fn select_mailbox(&mut self, mailbox: &str, mode: AccessMode) -> AppResult<u32> {
        let encoded = encode_utf7_imap(mailbox.to_owned());
        let limit = self.socket_timeout;
        let selected = match mode {
            AccessMode::ReadOnly => timeout(limit, self.session.examine(encoded)).await,
            AccessMode::ReadWrite => timeout(limit, self.session.select(encoded)).await,
        }
        .map_err(|_| AppError::Timeout(format!("{mode} select timed out for mailbox '{mailbox}'")))?
        .map_err(|e| AppError::NotFound(format!("cannot select mailbox '{mailbox}': {e}")))?;

        selected
            .uid_validity
            .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))
    }
}

impl SearchSession for ImapConnection {
    async fn uid_search(&mut self, query: &str) -> AppResult<Vec<u32>> {
        let set = bounded(self.socket_timeout, "UID SEARCH", self.session.uid_search(query)).await?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    async fn fetch_headers_batch(
        &mut self,
        uid_set: &str,
    ) -> AppResult<HashMap<u32, MessageHeaders>> {
        if uid_set.is_empty() {
            return Ok(HashMap::new());
        }
        let fetches = self.uid_fetch(uid_set, SUMMARY_QUERY).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| fetch.uid.map(|uid| (uid, message_headers(fetch))))
            .collect())
    }
}

fn message_headers(fetch: &Fetch) -> MessageHeaders {
    MessageHeaders {
        header_bytes: fetch
            .header()
            .or_else(|| fetch.body())
            .map(<[u8]>::to_vec)
            .unwrap_or_default(),
        flags: flags_to_strings(fetch),
        size_bytes: fetch.size,
    }
}

/// Render fetch flags in their `Debug` form (e.g. `Seen`, `Custom("x")`)
fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| format!("{flag:?}")).collect()
}
