//! Mailbox snapshot guard
//!
//! IMAP has no multi-command transactions, and UIDs only mean something
//! within one UIDVALIDITY epoch. Every handler that acts on a UID it got
//! from an earlier call opens the mailbox through [`MailboxLocks::open`],
//! which takes an in-process lock on the mailbox, selects it, and checks the
//! observed UIDVALIDITY against the one embedded in the message id or cursor.
//!
//! The lock is an owned `tokio` mutex guard inside [`MailboxLock`], so it is
//! released exactly once when the handle drops: on error returns, on `?`
//! propagation out of the handler, on panic, and when the handler future is
//! cancelled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// How the mailbox is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// `EXAMINE`: no flag side effects
    ReadOnly,
    /// `SELECT`: required for STORE/COPY/MOVE/EXPUNGE
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read-only"),
            Self::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// Session capable of selecting a mailbox and reporting its UIDVALIDITY
pub trait MailboxSelector {
    fn select_mailbox(
        &mut self,
        mailbox: &str,
        mode: AccessMode,
    ) -> impl Future<Output = AppResult<u32>> + Send;
}

type LockKey = (String, String);

/// Registry of per-(account, mailbox) locks
///
/// One instance per server process, shared by all handlers.
#[derive(Debug, Default)]
pub struct MailboxLocks {
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

/// Held mailbox lock plus the UIDVALIDITY observed under it
///
/// Dropping the value releases the lock.
#[derive(Debug)]
pub struct MailboxLock {
    mailbox: String,
    mode: AccessMode,
    uidvalidity: u32,
    _guard: OwnedMutexGuard<()>,
}

impl MailboxLock {
    /// UIDVALIDITY observed when the lock was taken
    ///
    /// Callers without an expected snapshot embed this value in the message
    /// ids and cursors they create.
    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity
    }
}

impl Drop for MailboxLock {
    fn drop(&mut self) {
        debug!(mailbox = %self.mailbox, mode = %self.mode, "released mailbox lock");
    }
}

impl MailboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock and select a mailbox, verifying its snapshot
    ///
    /// # Errors
    ///
    /// - `StaleMailboxSnapshot` if `expected` is given and differs from the
    ///   observed UIDVALIDITY
    /// - `MailboxOpenFailure` if the mailbox cannot be selected
    ///
    /// The lock is released before either error is returned.
    pub async fn open<S>(
        &self,
        session: &mut S,
        account_id: &str,
        mailbox: &str,
        mode: AccessMode,
        expected: Option<u32>,
    ) -> AppResult<MailboxLock>
    where
        S: MailboxSelector + Send,
    {
        let lock = self.entry(account_id, mailbox).await;
        let guard = lock.lock_owned().await;
        debug!(account_id, mailbox, %mode, "acquired mailbox lock");

        let observed = match session.select_mailbox(mailbox, mode).await {
            Ok(uidvalidity) => uidvalidity,
            Err(e) => {
                drop(guard);
                return Err(AppError::MailboxOpenFailure(format!(
                    "'{mailbox}' ({mode}): {e}"
                )));
            }
        };

        if let Some(expected) = expected
            && expected != observed
        {
            drop(guard);
            warn!(
                account_id,
                mailbox, expected, observed, "mailbox uidvalidity changed since snapshot"
            );
            return Err(AppError::StaleMailboxSnapshot {
                mailbox: mailbox.to_owned(),
                expected,
                observed,
            });
        }

        Ok(MailboxLock {
            mailbox: mailbox.to_owned(),
            mode,
            uidvalidity: observed,
            _guard: guard,
        })
    }

    /// Get or create the lock for a mailbox, pruning idle entries
    async fn entry(&self, account_id: &str, mailbox: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((account_id.to_owned(), mailbox.to_owned()))
            .or_default()
            .clone()
    }

    #[cfg(test)]
    async fn is_held(&self, account_id: &str, mailbox: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(&(account_id.to_owned(), mailbox.to_owned()))
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::{AccessMode, MailboxLocks, MailboxSelector};
    use crate::errors::{AppError, AppResult};

    /// Scripted session returning a fixed select outcome
    struct FakeSession {
        uidvalidity: Option<u32>,
        selected: Vec<(String, AccessMode)>,
    }

    impl FakeSession {
        fn with_uidvalidity(uidvalidity: u32) -> Self {
            Self {
                uidvalidity: Some(uidvalidity),
                selected: Vec::new(),
            }
        }

        fn failing() -> Self {
            Self {
                uidvalidity: None,
                selected: Vec::new(),
            }
        }
    }

    impl MailboxSelector for FakeSession {
        async fn select_mailbox(&mut self, mailbox: &str, mode: AccessMode) -> AppResult<u32> {
            self.selected.push((mailbox.to_owned(), mode));
            self.uidvalidity
                .ok_or_else(|| AppError::NotFound(format!("no mailbox '{mailbox}'")))
        }
    }

    #[tokio::test]
    async fn open_without_expectation_reports_observed_snapshot() {
        let locks = MailboxLocks::new();
        let mut session = FakeSession::with_uidvalidity(100);

        let lock = locks
            .open(&mut session, "default", "INBOX", AccessMode::ReadOnly, None)
            .await
            .expect("open succeeds");
        assert_eq!(lock.uidvalidity(), 100);
        assert_eq!(lock.mode, AccessMode::ReadOnly);
        assert_eq!(
            session.selected,
            vec![("INBOX".to_owned(), AccessMode::ReadOnly)]
        );
        assert!(locks.is_held("default", "INBOX").await);

        drop(lock);
        assert!(!locks.is_held("default", "INBOX").await);
    }

    #[tokio::test]
    async fn matching_expectation_holds_lock() {
        let locks = MailboxLocks::new();
        let mut session = FakeSession::with_uidvalidity(7);
        let lock = locks
            .open(&mut session, "default", "A:B", AccessMode::ReadWrite, Some(7))
            .await
            .expect("open succeeds");
        assert_eq!(lock.mailbox, "A:B");
        assert!(locks.is_held("default", "A:B").await);
    }

    #[tokio::test]
    async fn stale_snapshot_releases_lock() {
        let locks = MailboxLocks::new();
        let mut session = FakeSession::with_uidvalidity(8);

        let err = locks
            .open(&mut session, "default", "INBOX", AccessMode::ReadWrite, Some(7))
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
        assert!(!locks.is_held("default", "INBOX").await);
    }

    #[tokio::test]
    async fn select_failure_is_open_failure_and_releases_lock() {
        let locks = MailboxLocks::new();
        let mut session = FakeSession::failing();

        let err = locks
            .open(&mut session, "default", "Missing", AccessMode::ReadOnly, Some(1))
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::MailboxOpenFailure(_)));
        assert!(!locks.is_held("default", "Missing").await);
    }

    #[tokio::test]
    async fn second_open_waits_for_release() {
        let locks = MailboxLocks::new();
        let mut first = FakeSession::with_uidvalidity(1);
        let mut second = FakeSession::with_uidvalidity(1);

        let held = locks
            .open(&mut first, "default", "INBOX", AccessMode::ReadWrite, None)
            .await
            .expect("first open succeeds");

        let blocked = timeout(
            Duration::from_millis(50),
            locks.open(&mut second, "default", "INBOX", AccessMode::ReadOnly, None),
        )
        .await;
        assert!(blocked.is_err(), "second open must wait while lock is held");

        drop(held);
        let reopened = timeout(
            Duration::from_millis(500),
            locks.open(&mut second, "default", "INBOX", AccessMode::ReadOnly, None),
        )
        .await
        .expect("lock released")
        .expect("open succeeds");
        assert_eq!(reopened.uidvalidity(), 1);
    }

    #[tokio::test]
    async fn locks_are_scoped_per_account_and_mailbox() {
        let locks = MailboxLocks::new();
        let mut session = FakeSession::with_uidvalidity(1);

        let _inbox = locks
            .open(&mut session, "default", "INBOX", AccessMode::ReadOnly, None)
            .await
            .expect("open succeeds");
        let other = timeout(
            Duration::from_millis(500),
            locks.open(&mut session, "work", "INBOX", AccessMode::ReadOnly, None),
        )
        .await
        .expect("different account is not blocked");
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn error_in_caller_after_open_still_releases() {
        async fn act(locks: &MailboxLocks, session: &mut FakeSession) -> AppResult<()> {
            let _lock = locks
                .open(session, "default", "INBOX", AccessMode::ReadWrite, None)
                .await?;
            Err(AppError::Internal("store failed".to_owned()))
        }

        let locks = MailboxLocks::new();
        let mut session = FakeSession::with_uidvalidity(3);
        act(&locks, &mut session).await.expect_err("act fails");
        assert!(!locks.is_held("default", "INBOX").await);
    }
}
