//! `QueueStore` trait: the narrow interface the scheduler needs from the
//! shared store.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Backend-agnostic shared store.
///
/// Keys are fully built by [`crate::store::KeySpace`]; implementations
/// treat them as opaque strings. Every mutation is a single-key operation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // ── Pending ordering ────────────────────────────────────────────

    /// Add `member` to the ordered set at `key` with `score`. Re-adding an
    /// existing member updates its score.
    async fn add_pending(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Up to `limit` members with the lowest scores, lowest first. Equal
    /// scores are ordered by member name, as Redis sorted sets do.
    async fn lowest_pending(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Atomically remove `member`, returning how many members were
    /// actually removed (0 or 1). This is the claim race guard.
    async fn remove_pending(&self, key: &str, member: &str) -> Result<u64, StoreError>;

    /// Number of members in the ordered set.
    async fn pending_len(&self, key: &str) -> Result<usize, StoreError>;

    // ── Active set ──────────────────────────────────────────────────

    async fn add_active(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove `member`; returns whether it was present.
    async fn remove_active(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn active_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // ── Completed history ───────────────────────────────────────────

    /// Push `member` onto the front of the list at `key`, keeping only the
    /// newest `cap` entries.
    async fn push_history(&self, key: &str, member: &str, cap: usize) -> Result<(), StoreError>;

    /// Newest-first history entries.
    async fn history(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // ── Records ─────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` at `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write `value` at `key` only if no live value exists there. Returns
    /// whether the write happened. Check and write are one atomic step.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    // ── Discovery & pub/sub ─────────────────────────────────────────

    /// Keys matching a glob `pattern` (`*` and `?` wildcards).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Publish `payload` on `channel`; returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;
}
