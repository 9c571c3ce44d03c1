//! Cursor-based pagination storage
//!
//! Manages search cursors with a fixed TTL and capacity-bounded eviction.
//! Cursors hold the range-compressed UIDs of a search plus the read offset,
//! so later pages never re-run the search. Cleanup piggybacks on `create`
//! and `get`; there is no background sweep.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::uid_set::UidRange;

/// Time source for cursor expiry
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time via [`Instant::now`]
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cursor fields supplied by the search handler
#[derive(Debug, Clone)]
pub struct NewCursor {
    /// Tool that issued the cursor
    pub tool: String,
    /// Account identifier
    pub account_id: String,
    /// Mailbox name
    pub mailbox: String,
    /// Mailbox UIDVALIDITY at time of search
    pub uidvalidity: u32,
    /// Matching UIDs, descending and range-compressed
    pub uid_ranges: Vec<UidRange>,
    /// Next page starts here
    pub offset: usize,
    /// Total matches covered by `uid_ranges`
    pub total: usize,
    /// Whether snippet was included in original search
    pub include_snippet: bool,
    /// Snippet character limit from original search
    pub snippet_max_chars: usize,
}

/// Stored cursor
///
/// `expires_at` is fixed at creation; only `offset` ever changes.
#[derive(Debug, Clone)]
pub struct SearchCursor {
    /// Opaque random identifier handed to callers
    pub id: String,
    pub tool: String,
    pub account_id: String,
    pub mailbox: String,
    pub uidvalidity: u32,
    pub uid_ranges: Vec<UidRange>,
    pub offset: usize,
    pub total: usize,
    pub include_snippet: bool,
    pub snippet_max_chars: usize,
    pub created_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct StoredCursor {
    cursor: SearchCursor,
    /// Insertion order, breaks `created_at` ties during eviction
    seq: u64,
}

/// Cursor store with TTL and capacity eviction
///
/// Not internally synchronized; the server shares one instance behind a
/// single `tokio::sync::Mutex`.
#[derive(Debug)]
pub struct CursorStore {
    /// Fixed lifetime of each cursor from creation
    ttl: Duration,
    /// Maximum number of cursors to retain
    max_entries: usize,
    clock: Arc<dyn Clock>,
    next_seq: u64,
    /// Active cursors keyed by UUID
    entries: HashMap<String, StoredCursor>,
}

impl CursorStore {
    /// Create new cursor store using the system clock
    ///
    /// # Parameters
    ///
    /// - `ttl_ms`: Cursor lifetime in milliseconds (default 600000)
    /// - `max_entries`: Maximum cursors to retain (default 512)
    pub fn new(ttl_ms: u64, max_entries: usize) -> Self {
        Self::with_clock(ttl_ms, max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl_ms: u64, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: Duration::from_millis(ttl_ms),
            max_entries,
            clock,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Create and store a new cursor
    ///
    /// The ID is a v4 UUID drawn from the OS CSPRNG, so it cannot be guessed
    /// from other cursors. Sweeps expired entries, then evicts the oldest
    /// cursors by creation time while over capacity.
    pub fn create(&mut self, entry: NewCursor) -> SearchCursor {
        let now = self.clock.now();
        let cursor = SearchCursor {
            id: Uuid::new_v4().to_string(),
            tool: entry.tool,
            account_id: entry.account_id,
            mailbox: entry.mailbox,
            uidvalidity: entry.uidvalidity,
            uid_ranges: entry.uid_ranges,
            offset: entry.offset,
            total: entry.total,
            include_snippet: entry.include_snippet,
            snippet_max_chars: entry.snippet_max_chars,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            cursor.id.clone(),
            StoredCursor {
                cursor: cursor.clone(),
                seq,
            },
        );
        debug!(
            cursor = %cursor.id,
            account_id = %cursor.account_id,
            mailbox = %cursor.mailbox,
            total = cursor.total,
            ranges = cursor.uid_ranges.len(),
            "created search cursor"
        );

        self.cleanup(now);
        self.evict_if_needed();
        cursor
    }

    /// Retrieve cursor by ID
    ///
    /// Returns a clone if the cursor exists and has not expired. Expired
    /// entries are swept first, so an expired cursor is indistinguishable
    /// from an unknown one.
    pub fn get(&mut self, cursor: &str) -> Option<SearchCursor> {
        let now = self.clock.now();
        self.cleanup(now);
        self.entries
            .get(cursor)
            .filter(|stored| stored.cursor.expires_at > now)
            .map(|stored| stored.cursor.clone())
    }

    /// Move cursor to a new offset
    ///
    /// Honors expiry through [`CursorStore::get`] and never extends
    /// `expires_at`. The offset is stored as given.
    pub fn update(&mut self, cursor: &str, offset: usize) -> Option<SearchCursor> {
        self.get(cursor)?;
        let stored = self.entries.get_mut(cursor)?;
        stored.cursor.offset = offset;
        Some(stored.cursor.clone())
    }

    /// Delete cursor
    ///
    /// Removes cursor from store. Silently ignores missing cursors.
    pub fn delete(&mut self, cursor: &str) {
        if self.entries.remove(cursor).is_some() {
            debug!(cursor, "deleted search cursor");
        }
    }

    /// Number of cursors currently held, expired or not
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Remove expired cursors
    fn cleanup(&mut self, now: Instant) {
        self.entries.retain(|_, stored| stored.cursor.expires_at > now);
    }

    /// Evict cursors if exceeding `max_entries`
    ///
    /// Removes the earliest-created entries until under the limit. Access
    /// does not promote a cursor.
    fn evict_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }

        let overflow = self.entries.len() - self.max_entries;
        let mut ids_by_age: Vec<(Instant, u64, String)> = self
            .entries
            .iter()
            .map(|(id, stored)| (stored.cursor.created_at, stored.seq, id.clone()))
            .collect();
        ids_by_age.sort_unstable();

        for (_, _, id) in ids_by_age.into_iter().take(overflow) {
            self.entries.remove(&id);
            debug!(cursor = %id, "evicted search cursor over capacity");
        }
    }
}
