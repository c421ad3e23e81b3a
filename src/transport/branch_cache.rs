use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::sip::{parse_via_header, SipRequest};

/// RFC 3261 準拠スタックが branch の先頭に付ける magic cookie
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Branch identifiers seen recently, used to drop UDP retransmissions of
/// requests that were already handed to the application.
///
/// An entry only suppresses arrivals within `retention` of the time it was
/// recorded. Older entries are ignored by [`BranchCache::check_and_record`]
/// even before [`BranchCache::sweep`] deletes them.
pub struct BranchCache {
    entries: Mutex<HashMap<String, Instant>>,
    retention: Duration,
}

impl BranchCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Records `branch` as seen at `now` unless it is already remembered.
    ///
    /// Returns `true` for a fresh branch and `false` for a retransmission.
    /// Lookup and insert happen under one lock. A duplicate does not extend
    /// the lifetime of the entry.
    pub fn check_and_record(&self, branch: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        if let Some(seen_at) = entries.get(branch) {
            if now.saturating_duration_since(*seen_at) <= self.retention {
                return false;
            }
        }
        entries.insert(branch.to_string(), now);
        true
    }

    /// Drops every entry older than the retention window. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let retention = self.retention;
        entries.retain(|_, seen_at| now.saturating_duration_since(*seen_at) <= retention);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

/// `z9hG4bK` で始まり、cookie の後ろに最低 1 文字あること
pub fn is_valid_branch(branch: &str) -> bool {
    branch.len() > MAGIC_COOKIE.len() && branch.starts_with(MAGIC_COOKIE)
}

/// Branch of the topmost Via, if the request carries a valid one.
pub fn transaction_branch(req: &SipRequest) -> Option<String> {
    let via = parse_via_header(req.top_via()?).ok()?;
    via.branch()
        .filter(|b| is_valid_branch(b))
        .map(str::to_string)
}
