//! Environment-driven configuration
//!
//! Accounts are declared as `MAIL_IMAP_<SEGMENT>_{HOST,USER,PASS,PORT,SECURE}`
//! and found by matching every `MAIL_IMAP_*_HOST` key. The account id is the
//! lowercased segment restricted to `[a-z0-9_]`, which keeps `:` out of ids
//! that end up inside message ids. Server-wide keys cover timeouts, the write
//! gate, cursor lifetime and capacity, and the pagination ceiling.

use std::any::type_name;
use std::collections::BTreeMap;
use std::env;
use std::env::VarError;
use std::str::FromStr;

use regex::Regex;
use secrecy::SecretString;
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// One IMAP account
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Lowercase id derived from the env segment (`WORK` → `work`)
    pub account_id: String,
    pub host: String,
    /// Defaults to 993
    pub port: u16,
    /// Must be `true`; plaintext IMAP is refused at connect time
    pub secure: bool,
    pub user: String,
    /// Never logged or serialized
    pub pass: SecretString,
}

/// Process-wide settings shared by every tool handler
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Accounts keyed by `account_id`, in sorted order
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Gate for flag updates, copy, move and delete
    pub write_enabled: bool,
    /// TCP connect limit (ms)
    pub connect_timeout_ms: u64,
    /// TLS handshake, greeting and LOGIN limit (ms)
    pub greeting_timeout_ms: u64,
    /// Per-command limit once logged in (ms)
    pub socket_timeout_ms: u64,
    /// Fixed lifetime of a search cursor from creation, in milliseconds
    pub cursor_ttl_ms: u64,
    /// Maximum number of cursors to retain (oldest evicted first)
    pub cursor_max_entries: usize,
    /// Match count above which a search returns one page and no cursor
    pub pagination_max_matches: usize,
}

impl ServerConfig {
    /// Build the configuration from the process environment
    ///
    /// With no `MAIL_IMAP_*_HOST` key at all, the `DEFAULT` segment is
    /// assumed, so `MAIL_IMAP_DEFAULT_{HOST,USER,PASS}` become mandatory.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a missing required key, an unparsable value, or a
    /// zero cursor capacity or pagination ceiling.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_DEFAULT_HOST=imap.fastmail.com
    /// MAIL_IMAP_DEFAULT_USER=me@fastmail.com
    /// MAIL_IMAP_DEFAULT_PASS=app-password
    /// MAIL_IMAP_ARCHIVE_HOST=imap.example.org
    /// MAIL_IMAP_ARCHIVE_USER=archive@example.org
    /// MAIL_IMAP_ARCHIVE_PASS=secret
    /// MAIL_IMAP_CURSOR_TTL_MS=600000
    /// MAIL_IMAP_CURSOR_MAX_ENTRIES=512
    /// MAIL_IMAP_PAGINATION_MAX_MATCHES=20000
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let host_key = Regex::new(r"^MAIL_IMAP_([A-Z0-9_]+)_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut segments: Vec<String> = env::vars()
            .filter_map(|(key, _)| {
                host_key
                    .captures(&key)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_owned())
            })
            .collect();
        if segments.is_empty() {
            segments.push("DEFAULT".to_owned());
        }
        segments.sort();
        segments.dedup();

        let accounts = segments
            .iter()
            .map(|segment| {
                let account = load_account(segment)?;
                debug!(account_id = %account.account_id, host = %account.host, "loaded account");
                Ok((account.account_id.clone(), account))
            })
            .collect::<AppResult<BTreeMap<_, _>>>()?;

        let config = Self {
            accounts,
            write_enabled: parse_bool_env("MAIL_IMAP_WRITE_ENABLED", false)?,
            connect_timeout_ms: parse_num_env("MAIL_IMAP_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_num_env("MAIL_IMAP_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_num_env("MAIL_IMAP_SOCKET_TIMEOUT_MS", 300_000)?,
            cursor_ttl_ms: parse_num_env("MAIL_IMAP_CURSOR_TTL_MS", 600_000)?,
            cursor_max_entries: parse_num_env("MAIL_IMAP_CURSOR_MAX_ENTRIES", 512)?,
            pagination_max_matches: parse_num_env("MAIL_IMAP_PAGINATION_MAX_MATCHES", 20_000)?,
        };
        for (key, value) in [
            ("MAIL_IMAP_CURSOR_MAX_ENTRIES", config.cursor_max_entries),
            ("MAIL_IMAP_PAGINATION_MAX_MATCHES", config.pagination_max_matches),
        ] {
            if value == 0 {
                return Err(AppError::InvalidInput(format!("{key} must be at least 1")));
            }
        }
        Ok(config)
    }

    /// Look up an account
    ///
    /// # Errors
    ///
    /// `NotFound` for an id that is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| AppError::NotFound(format!("account '{account_id}' is not configured")))
    }
}

fn load_account(segment: &str) -> AppResult<AccountConfig> {
    let prefix = format!("MAIL_IMAP_{}_", sanitize_segment(segment));
    let key = |suffix: &str| format!("{prefix}{suffix}");

    Ok(AccountConfig {
        account_id: account_id_for_segment(segment),
        host: required_env(&key("HOST"))?,
        port: parse_num_env(&key("PORT"), 993)?,
        secure: parse_bool_env(&key("SECURE"), true)?,
        user: required_env(&key("USER"))?,
        pass: SecretString::new(required_env(&key("PASS"))?.into()),
    })
}

/// Map an env segment to its account id (`WORK_2` → `work_2`)
fn account_id_for_segment(segment: &str) -> String {
    sanitize_segment(segment).to_ascii_lowercase()
}

/// Uppercase the segment, turn anything not alphanumeric into `_`, and trim
/// surrounding underscores
fn sanitize_segment(segment: &str) -> String {
    let replaced: String = segment
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    replaced.trim_matches('_').to_owned()
}

/// Read an env var, treating "unset" as `None` and non-UTF-8 as an error
fn read_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Read a key that must be set to something other than whitespace
fn required_env(key: &str) -> AppResult<String> {
    read_env(key)?
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("missing required environment variable {key}")))
}

/// Boolean key; see [`parse_bool_value`] for the accepted spellings
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match read_env(key)? {
        None => Ok(default),
        Some(raw) => parse_bool_value(&raw).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{raw}'"))
        }),
    }
}

/// `1/true/yes/y/on` or `0/false/no/n/off`, case-insensitive, trimmed
fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Numeric key of any `FromStr` type, `default` when unset
fn parse_num_env<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match read_env(key)? {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!(
                "invalid {} environment variable {key}: '{raw}'",
                type_name::<T>()
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{account_id_for_segment, parse_bool_value, sanitize_segment};

    #[test]
    fn account_ids_never_contain_message_id_delimiter() {
        assert_eq!(account_id_for_segment("DEFAULT"), "default");
        assert_eq!(account_id_for_segment("WORK_2"), "work_2");
        assert_eq!(account_id_for_segment("A:B"), "a_b");
    }

    #[test]
    fn sanitize_trims_edge_separators() {
        assert_eq!(sanitize_segment("-work-"), "WORK");
        assert_eq!(sanitize_segment("team.mail"), "TEAM_MAIL");
    }

    #[test]
    fn bool_spellings() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true), "{truthy}");
        }
        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false), "{falsy}");
        }
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None, "{invalid}");
        }
    }
}
