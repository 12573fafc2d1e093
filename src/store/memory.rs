//! In-memory `QueueStore`: the reference implementation.
//!
//! All structures live behind one mutex, so every trait call is atomic
//! with respect to every other call. Record expiry is enforced lazily on
//! read and during key scans.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::traits::QueueStore;

/// Default broadcast channel capacity per pub/sub channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct PendingEntry {
    member: String,
    score: f64,
}

#[derive(Debug)]
struct RecordEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Vec<PendingEntry>>,
    active: HashMap<String, HashSet<String>>,
    history: HashMap<String, VecDeque<String>>,
    records: HashMap<String, RecordEntry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn purge_expired(&mut self, now: Instant) {
        self.records.retain(|_, entry| entry.expires_at > now);
    }
}

/// Process-local store satisfying the same contract as the Redis backend.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a pub/sub channel. Messages published before the
    /// subscription are not replayed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut inner = self.lock();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another caller panicked mid-call; the
        // maps themselves are still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Translate a glob pattern into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn add_pending(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entries = inner.pending.entry(key.to_string()).or_default();
        entries.retain(|e| e.member != member);
        entries.push(PendingEntry {
            member: member.to_string(),
            score,
        });
        // Same ordering as a Redis sorted set: score, then member bytes.
        entries.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(())
    }

    async fn lowest_pending(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .pending
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .take(limit)
                    .map(|e| e.member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_pending(&self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let Some(entries) = inner.pending.get_mut(key) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| e.member != member);
        let removed = (before - entries.len()) as u64;
        if entries.is_empty() {
            inner.pending.remove(key);
        }
        Ok(removed)
    }

    async fn pending_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().pending.get(key).map_or(0, Vec::len))
    }

    async fn add_active(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock()
            .active
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_active(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(set) = inner.active.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.active.remove(key);
        }
        Ok(removed)
    }

    async fn active_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .active
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn push_history(&self, key: &str, member: &str, cap: usize) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let list = inner.history.entry(key.to_string()).or_default();
        list.push_front(member.to_string());
        list.truncate(cap);
        Ok(())
    }

    async fn history(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .history
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired = match inner.records.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.records.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock().records.insert(
            key.to_string(),
            RecordEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        if inner.records.get(key).is_some_and(|entry| entry.expires_at > now) {
            return Ok(false);
        }
        inner.records.insert(
            key.to_string(),
            RecordEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.records.remove(key);
        inner.pending.remove(key);
        inner.active.remove(key);
        inner.history.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let re = glob_to_regex(pattern)?;
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        let mut keys: Vec<String> = inner
            .pending
            .keys()
            .chain(inner.active.keys())
            .chain(inner.history.keys())
            .chain(inner.records.keys())
            .filter(|k| re.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let inner = self.lock();
        // No sender yet means nobody ever subscribed.
        Ok(inner
            .channels
            .get(channel)
            .and_then(|tx| tx.send(payload.to_string()).ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn pending_orders_by_score_then_member() {
        let store = InMemoryStore::new();
        store.add_pending("pending:q", "c", 2.0).await.unwrap();
        store.add_pending("pending:q", "a", 1.0).await.unwrap();
        store.add_pending("pending:q", "b", 2.0).await.unwrap();

        let ids = store.lowest_pending("pending:q", 10).await.unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.lowest_pending("pending:q", 1).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn remove_pending_reports_count() {
        let store = InMemoryStore::new();
        store.add_pending("pending:q", "a", 1.0).await.unwrap();

        assert_eq!(store.remove_pending("pending:q", "a").await.unwrap(), 1);
        assert_eq!(store.remove_pending("pending:q", "a").await.unwrap(), 0);
        assert_eq!(store.remove_pending("pending:missing", "a").await.unwrap(), 0);
        assert_eq!(store.pending_len("pending:q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_removal_has_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        store.add_pending("pending:q", "only", 1.0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.remove_pending("pending:q", "only").await.unwrap()
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn records_expire() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("task:1", "{}", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("task:1").await.unwrap().as_deref(), Some("{}"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("task:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_if_absent_refuses_live_keys() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_millis(20);
        assert!(store.set_if_absent("task:1", "first", ttl).await.unwrap());
        assert!(!store.set_if_absent("task:1", "second", ttl).await.unwrap());
        assert_eq!(store.get("task:1").await.unwrap().as_deref(), Some("first"));

        // Expired keys count as absent.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_if_absent("task:1", "third", ttl).await.unwrap());
        assert_eq!(store.get("task:1").await.unwrap().as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn history_is_capped_newest_first() {
        let store = InMemoryStore::new();
        for id in ["1", "2", "3", "4"] {
            store.push_history("completed:q", id, 3).await.unwrap();
        }
        assert_eq!(store.history("completed:q").await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn scan_matches_glob() {
        let store = InMemoryStore::new();
        store.add_pending("pending:s1", "a", 1.0).await.unwrap();
        store.add_pending("pending:s2", "b", 1.0).await.unwrap();
        store.add_active("active:s1", "c").await.unwrap();

        let keys = store.scan_keys("pending:*").await.unwrap();
        assert_eq!(keys, vec!["pending:s1", "pending:s2"]);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("updates", "ignored").await.unwrap(), 0);

        let mut rx = store.subscribe("updates");
        assert_eq!(store.publish("updates", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn active_set_membership() {
        let store = InMemoryStore::new();
        store.add_active("active:q", "a").await.unwrap();
        assert_eq!(store.active_members("active:q").await.unwrap(), vec!["a"]);
        assert!(store.remove_active("active:q", "a").await.unwrap());
        assert!(!store.remove_active("active:q", "a").await.unwrap());
    }
}
