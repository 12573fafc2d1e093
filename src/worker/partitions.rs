//! Which partitions a pool polls.

use std::collections::BTreeSet;

use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::tasks::TaskQueue;

/// Partition set for one pool: an explicit registered set, optionally
/// merged with partitions discovered from `pending:*` keys each cycle.
pub struct PartitionSource {
    registered: RwLock<BTreeSet<String>>,
    /// Never picked up by discovery (still served if registered).
    excluded: BTreeSet<String>,
    discover: bool,
}

impl PartitionSource {
    /// Serve exactly `partitions` (plus any registered later).
    pub fn fixed(partitions: impl IntoIterator<Item = String>) -> Self {
        Self {
            registered: RwLock::new(partitions.into_iter().collect()),
            excluded: BTreeSet::new(),
            discover: false,
        }
    }

    /// Serve registered partitions and whatever the keyspace scan finds.
    pub fn discovering(partitions: impl IntoIterator<Item = String>) -> Self {
        Self {
            registered: RwLock::new(partitions.into_iter().collect()),
            excluded: BTreeSet::new(),
            discover: true,
        }
    }

    /// Keep discovery away from partitions another pool owns.
    pub fn excluding(mut self, partitions: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(partitions);
        self
    }

    pub fn is_discovering(&self) -> bool {
        self.discover
    }

    /// Returns `false` if the partition was already registered.
    pub async fn register(&self, partition: impl Into<String>) -> bool {
        self.registered.write().await.insert(partition.into())
    }

    pub async fn unregister(&self, partition: &str) -> bool {
        self.registered.write().await.remove(partition)
    }

    pub async fn registered(&self) -> Vec<String> {
        self.registered.read().await.iter().cloned().collect()
    }

    /// Partitions to poll this cycle, sorted and deduplicated.
    ///
    /// Discovery costs one keyspace scan per call.
    pub async fn resolve(&self, queue: &TaskQueue) -> Result<Vec<String>, StoreError> {
        let mut partitions = self.registered.read().await.clone();

        if self.discover {
            let keys = queue.keys();
            for key in queue.store().scan_keys(&keys.pending_pattern()).await? {
                if let Some(partition) = keys.partition_from_pending(&key)
                    && !self.excluded.contains(&partition)
                {
                    partitions.insert(partition);
                }
            }
        }

        Ok(partitions.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::RecordConfig;
    use crate::events::EventPublisher;
    use crate::store::{InMemoryStore, KeySpace};
    use crate::tasks::NewTask;

    fn queue(prefix: &str) -> TaskQueue {
        let store = Arc::new(InMemoryStore::new());
        let keys = KeySpace::new(prefix);
        let publisher = EventPublisher::new(store.clone(), &keys);
        TaskQueue::new(store, keys, RecordConfig::default(), publisher)
    }

    #[tokio::test]
    async fn fixed_source_ignores_other_partitions() {
        let queue = queue("");
        queue
            .enqueue(NewTask::new("echo", json!(null)).in_partition("session-1"))
            .await
            .unwrap();

        let source = PartitionSource::fixed(vec!["background".to_string()]);
        assert_eq!(source.resolve(&queue).await.unwrap(), vec!["background"]);
    }

    #[tokio::test]
    async fn discovery_skips_excluded_partitions() {
        let queue = queue("");
        for partition in ["background", "session-1"] {
            queue
                .enqueue(NewTask::new("echo", json!(null)).in_partition(partition))
                .await
                .unwrap();
        }

        let source =
            PartitionSource::discovering(Vec::new()).excluding(vec!["background".to_string()]);
        assert_eq!(source.resolve(&queue).await.unwrap(), vec!["session-1"]);
    }

    #[tokio::test]
    async fn discovery_merges_with_registered() {
        let queue = queue("app");
        for partition in ["session-b", "session-a"] {
            queue
                .enqueue(NewTask::new("agent_turn", json!(null)).in_partition(partition))
                .await
                .unwrap();
        }

        let source = PartitionSource::discovering(Vec::new());
        assert!(source.register("session-c").await);
        assert!(!source.register("session-c").await);

        assert_eq!(
            source.resolve(&queue).await.unwrap(),
            vec!["session-a", "session-b", "session-c"]
        );

        assert!(source.unregister("session-c").await);
        assert_eq!(
            source.resolve(&queue).await.unwrap(),
            vec!["session-a", "session-b"]
        );
    }
}
