//! Claim protocol: turning "an id is visible in pending" into "exactly one
//! worker owns it".
//!
//! There is no lock manager. Ownership is decided by the store's atomic
//! removal from the pending ordering: several workers may read the same id,
//! but only one removal reports a removed count of 1.

use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::events::TaskEventKind;
use crate::tasks::{TaskQueue, TaskRecord};

/// Result of a claim attempt. Losing a race is an expected outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker owns the task; the record is already stamped `running`.
    Won(TaskRecord),
    /// Another worker removed the id first.
    Lost,
    /// Nothing claimable in the partition.
    Empty,
    /// The removal succeeded but the record could not be loaded or
    /// annotated. The task is lost and is not retried.
    Abandoned { task_id: String },
}

impl ClaimOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }

    pub fn into_record(self) -> Option<TaskRecord> {
        match self {
            Self::Won(record) => Some(record),
            _ => None,
        }
    }
}

/// Performs claims on behalf of one worker identity.
#[derive(Clone)]
pub struct Claimer {
    queue: TaskQueue,
    worker_id: String,
    candidates: usize,
}

impl Claimer {
    pub fn new(queue: TaskQueue, worker_id: impl Into<String>, candidates: usize) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            candidates: candidates.max(1),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim the lowest-scored claimable task in `partition`.
    ///
    /// Lost races move on to the next candidate. Returns `Empty` when the
    /// ordering is empty or every candidate went to other workers.
    pub async fn claim_next(&self, partition: &str) -> Result<ClaimOutcome, StoreError> {
        let pending_key = self.queue.keys().pending(partition);
        let candidates = self
            .queue
            .store()
            .lowest_pending(&pending_key, self.candidates)
            .await?;

        for task_id in candidates {
            match self.try_claim(partition, &task_id).await? {
                ClaimOutcome::Lost => {
                    debug!(task_id = %task_id, partition, "Lost claim race, trying next candidate");
                }
                outcome => return Ok(outcome),
            }
        }
        Ok(ClaimOutcome::Empty)
    }

    /// One claim attempt on a known task id.
    pub async fn try_claim(
        &self,
        partition: &str,
        task_id: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let store = self.queue.store();
        let keys = self.queue.keys();

        let removed = store.remove_pending(&keys.pending(partition), task_id).await?;
        if removed == 0 {
            return Ok(ClaimOutcome::Lost);
        }

        // The id is ours from here on. Failures below cannot be handed back
        // to the pending ordering without risking a second claim.
        if let Err(e) = store.add_active(&keys.active(partition), task_id).await {
            return Ok(self.abandon(partition, task_id, &e.to_string()).await);
        }

        let mut record = match self.queue.get(task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(self.abandon(partition, task_id, "record missing").await),
            Err(e) => return Ok(self.abandon(partition, task_id, &e.to_string()).await),
        };

        if let Err(reason) = record.mark_running(&self.worker_id) {
            return Ok(self.abandon(partition, task_id, &reason).await);
        }

        if let Err(e) = self.queue.save(&record).await {
            return Ok(self.abandon(partition, task_id, &e.to_string()).await);
        }

        self.queue
            .publisher()
            .publish_record(TaskEventKind::Started, &record)
            .await;

        info!(
            task_id = %task_id,
            partition,
            kind = %record.kind,
            worker_id = %self.worker_id,
            "Task claimed"
        );
        Ok(ClaimOutcome::Won(record))
    }

    /// Drop a won claim whose record is unusable.
    async fn abandon(&self, partition: &str, task_id: &str, reason: &str) -> ClaimOutcome {
        error!(
            task_id = %task_id,
            partition,
            worker_id = %self.worker_id,
            reason,
            "Lost claim: task removed from pending but its record is unusable"
        );
        let active_key = self.queue.keys().active(partition);
        if let Err(e) = self.queue.store().remove_active(&active_key, task_id).await {
            debug!(task_id = %task_id, error = %e, "Failed to clear abandoned id from active set");
        }
        ClaimOutcome::Abandoned {
            task_id: task_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::RecordConfig;
    use crate::events::{EventPublisher, TaskEvent};
    use crate::store::{InMemoryStore, KeySpace, QueueStore};
    use crate::tasks::{NewTask, TaskStatus};

    fn setup() -> (TaskQueue, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let keys = KeySpace::default();
        let publisher = EventPublisher::new(store.clone(), &keys);
        (
            TaskQueue::new(store.clone(), keys, RecordConfig::default(), publisher),
            store,
        )
    }

    #[tokio::test]
    async fn empty_partition_is_not_an_error() {
        let (queue, _) = setup();
        let claimer = Claimer::new(queue, "w1", 10);
        assert_eq!(claimer.claim_next("background").await.unwrap(), ClaimOutcome::Empty);
    }

    #[tokio::test]
    async fn winning_claim_stamps_record_and_publishes() {
        let (queue, store) = setup();
        let mut rx = store.subscribe("updates");
        let submitted = queue.enqueue(NewTask::new("echo", json!("hi"))).await.unwrap();

        let claimer = Claimer::new(queue.clone(), "w1", 10);
        let record = claimer
            .claim_next("background")
            .await
            .unwrap()
            .into_record()
            .unwrap();

        assert_eq!(record.id, submitted.id);
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.assigned_worker_id.as_deref(), Some("w1"));
        assert!(record.started_at.is_some());

        let stored = queue.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(
            store.active_members("active:background").await.unwrap(),
            vec![record.id.clone()]
        );

        let event: TaskEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event, TaskEventKind::Started);
    }

    #[tokio::test]
    async fn second_attempt_on_same_id_loses() {
        let (queue, _) = setup();
        let record = queue.enqueue(NewTask::new("echo", json!(null))).await.unwrap();

        let a = Claimer::new(queue.clone(), "a", 10);
        let b = Claimer::new(queue.clone(), "b", 10);
        assert!(a.try_claim("background", &record.id).await.unwrap().is_won());
        assert_eq!(
            b.try_claim("background", &record.id).await.unwrap(),
            ClaimOutcome::Lost
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_workers_have_exactly_one_winner() {
        let (queue, _) = setup();
        let record = queue.enqueue(NewTask::new("echo", json!(null))).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let claimer = Claimer::new(queue.clone(), format!("worker-{i}"), 10);
            let task_id = record.id.clone();
            handles.push(tokio::spawn(async move {
                claimer.try_claim("background", &task_id).await
            }));
        }

        let mut won = 0;
        let mut lost = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ClaimOutcome::Won(_) => won += 1,
                ClaimOutcome::Lost => lost += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(lost, 11);
    }

    #[tokio::test]
    async fn claims_follow_score_order() {
        let (queue, _) = setup();
        let first = queue.enqueue(NewTask::new("echo", json!(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = queue.enqueue(NewTask::new("echo", json!(2))).await.unwrap();

        let claimer = Claimer::new(queue, "w", 10);
        let a = claimer.claim_next("background").await.unwrap().into_record().unwrap();
        let b = claimer.claim_next("background").await.unwrap().into_record().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }

    #[tokio::test]
    async fn missing_record_abandons_claim() {
        let (queue, store) = setup();
        store.add_pending("pending:background", "ghost", 1.0).await.unwrap();

        let claimer = Claimer::new(queue, "w", 10);
        let outcome = claimer.claim_next("background").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Abandoned {
                task_id: "ghost".to_string()
            }
        );
        // Not retried: the id is gone from both pending and active.
        assert_eq!(store.pending_len("pending:background").await.unwrap(), 0);
        assert!(store.active_members("active:background").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_pending_record_abandons_claim() {
        let (queue, store) = setup();
        let mut record = queue.enqueue(NewTask::new("echo", json!(null))).await.unwrap();
        record.mark_running("someone-else").unwrap();
        queue.save(&record).await.unwrap();

        let claimer = Claimer::new(queue.clone(), "w", 10);
        let outcome = claimer.try_claim("background", &record.id).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Abandoned { .. }));

        let stored = queue.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("someone-else"));
        assert_eq!(store.pending_len("pending:background").await.unwrap(), 0);
    }
}
