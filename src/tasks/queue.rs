//! Task queue: producer-side access to the shared store.
//!
//! Submitters enqueue records here; workers use the same type to persist
//! records as they move through their lifecycle, so the key layout and
//! TTL policy live in one place.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RecordConfig;
use crate::error::StoreError;
use crate::events::{EventPublisher, TaskEventKind};
use crate::store::{KeySpace, QueueStore};
use crate::tasks::model::{NewTask, TaskRecord};

/// Error text recorded on tasks cancelled before a worker claimed them.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Point-in-time counts for one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
}

/// Shared-store task queue.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    keys: KeySpace,
    records: RecordConfig,
    publisher: EventPublisher,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: KeySpace,
        records: RecordConfig,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            keys,
            records,
            publisher,
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn record_config(&self) -> &RecordConfig {
        &self.records
    }

    /// Write a new pending record and make it claimable.
    ///
    /// The record is written before the id enters the pending ordering, so
    /// a worker that claims the id can always load it. An id whose record
    /// still exists is refused with `StoreError::DuplicateTask`, whatever
    /// state that record is in.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new(task);
        let created = self
            .store
            .set_if_absent(
                &self.keys.task(&record.id),
                &record.to_json()?,
                record.ttl(&self.records),
            )
            .await?;
        if !created {
            warn!(task_id = %record.id, "Refusing to enqueue a task id that already exists");
            return Err(StoreError::DuplicateTask { id: record.id });
        }
        self.store
            .add_pending(&self.keys.pending(&record.partition), &record.id, record.score())
            .await?;

        info!(
            task_id = %record.id,
            kind = %record.kind,
            partition = %record.partition,
            "Task enqueued"
        );
        Ok(record)
    }

    /// Load a record. Expired and unknown ids both yield `None`.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        match self.store.get(&self.keys.task(task_id)).await? {
            Some(raw) => Ok(Some(TaskRecord::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist a record with the TTL for its current status.
    pub async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let raw = record.to_json()?;
        self.store
            .set_with_ttl(&self.keys.task(&record.id), &raw, record.ttl(&self.records))
            .await
    }

    /// Persist a terminal record and move its id from the active set into
    /// the partition's completed history.
    pub async fn finish(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.save(record).await?;
        self.store
            .remove_active(&self.keys.active(&record.partition), &record.id)
            .await?;
        self.store
            .push_history(
                &self.keys.completed(&record.partition),
                &record.id,
                self.records.history_limit,
            )
            .await
    }

    /// Cancel a task that no worker has claimed yet.
    ///
    /// Uses the same atomic removal as a claim, so it either beats every
    /// worker to the id (returns `true`, record marked failed) or loses and
    /// leaves the task alone (returns `false`).
    pub async fn cancel_pending(&self, task_id: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.get(task_id).await? else {
            return Ok(false);
        };

        let removed = self
            .store
            .remove_pending(&self.keys.pending(&record.partition), task_id)
            .await?;
        if removed == 0 {
            return Ok(false);
        }

        if let Err(reason) = record.fail(CANCELLED_ERROR) {
            // Removed from pending but the record was not pending: the id
            // was stale. Nothing left to update.
            warn!(task_id = %task_id, %reason, "Cancelled id had a non-pending record");
            return Ok(true);
        }

        self.save(&record).await?;
        self.store
            .push_history(
                &self.keys.completed(&record.partition),
                &record.id,
                self.records.history_limit,
            )
            .await?;
        self.publisher
            .publish_record(TaskEventKind::Failed, &record)
            .await;

        info!(task_id = %task_id, partition = %record.partition, "Pending task cancelled");
        Ok(true)
    }

    /// Pending and active counts for a partition.
    pub async fn stats(&self, partition: &str) -> Result<QueueStats, StoreError> {
        Ok(QueueStats {
            pending: self.store.pending_len(&self.keys.pending(partition)).await?,
            active: self
                .store
                .active_members(&self.keys.active(partition))
                .await?
                .len(),
        })
    }

    /// Most recent terminal task ids for a partition, newest first.
    pub async fn recent_completed(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.store.history(&self.keys.completed(partition)).await
    }
}
