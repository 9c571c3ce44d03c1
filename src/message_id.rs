//! Stable, opaque message identifier parsing and encoding
//!
//! Provides a message ID format that encodes account, mailbox,
//! UIDVALIDITY, and UID into a stable string. Mailbox names may
//! contain colons, which are preserved during parsing.

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Literal first segment of every message ID
pub const MESSAGE_ID_PREFIX: &str = "imap";

const DELIMITER: char = ':';

/// Stable message identifier
///
/// Names one message as of a specific mailbox snapshot. The embedded
/// `uidvalidity` is not a live value: handlers must re-check it against the
/// mailbox before acting on `uid`.
///
/// # Format
///
/// `imap:{account_id}:{mailbox}:{uidvalidity}:{uid}`
///
/// The `mailbox` segment may contain colons internally (e.g.,
/// `Projects:2026:Q1`). Everything between `account_id` and the
/// final two segments is the mailbox.
///
/// # Example
///
/// ```text
/// imap:default:INBOX:12345:42
/// imap:acct:Projects:2026:Q1:999:7
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Account identifier (never contains `:`)
    pub account_id: String,
    /// Mailbox name (may contain colons)
    pub mailbox: String,
    /// IMAP UIDVALIDITY (mailbox snapshot identifier)
    pub uidvalidity: u32,
    /// Message UID within mailbox
    pub uid: u32,
}

impl MessageId {
    /// Parse message ID from string
    ///
    /// Total over all inputs: any string that is not a well-formed ID
    /// yields `InvalidMessageId`, never a partial value. Rejects:
    /// - fewer than 5 segments
    /// - a first segment other than `imap`
    /// - an empty account or mailbox
    /// - UIDVALIDITY or UID that are not plain unsigned decimal `u32`
    pub fn parse(raw: &str) -> AppResult<Self> {
        let parts: Vec<&str> = raw.split(DELIMITER).collect();
        let [prefix, account_id, mailbox_parts @ .., uidvalidity, uid] = parts.as_slice() else {
            return Err(AppError::invalid_message_id(
                "message_id must have at least 5 segments",
            ));
        };
        if mailbox_parts.is_empty() {
            return Err(AppError::invalid_message_id(
                "message_id must have at least 5 segments",
            ));
        }
        if *prefix != MESSAGE_ID_PREFIX {
            return Err(AppError::invalid_message_id(
                "message_id must start with 'imap'",
            ));
        }
        if account_id.is_empty() {
            return Err(AppError::invalid_message_id(
                "message_id account cannot be empty",
            ));
        }

        let mailbox = mailbox_parts.join(":");
        if mailbox.is_empty() {
            return Err(AppError::invalid_message_id(
                "message_id mailbox cannot be empty",
            ));
        }

        let uidvalidity = parse_number(uidvalidity)
            .ok_or_else(|| AppError::invalid_message_id("invalid uidvalidity in message_id"))?;
        let uid = parse_number(uid)
            .ok_or_else(|| AppError::invalid_message_id("invalid uid in message_id"))?;

        Ok(Self {
            account_id: (*account_id).to_owned(),
            mailbox,
            uidvalidity,
            uid,
        })
    }

    /// Encode message ID to string
    ///
    /// Produces the canonical string format. The mailbox is not escaped;
    /// [`MessageId::parse`] recovers it from the segment positions.
    pub fn encode(&self) -> String {
        format!(
            "{MESSAGE_ID_PREFIX}:{}:{}:{}:{}",
            self.account_id, self.mailbox, self.uidvalidity, self.uid
        )
    }
}

/// Digits only: `str::parse` would also accept a leading `+`.
fn parse_number(segment: &str) -> Option<u32> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse::<u32>().ok()
}
