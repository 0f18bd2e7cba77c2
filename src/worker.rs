//! Queue dispatcher and worker loop
//!
//! Workers are stateless: each invocation pulls one work item, claims its
//! queue through a conditional status update, runs the assigner under the
//! item's time budget, persists the result, and re-enqueues a continuation
//! when the budget ran out first. All coordination is through the store and
//! the checkpoint store; redelivered duplicates lose the claim race and
//! no-op.
//!
//! Delivery is at-least-once, so every path here is safe to re-run: the
//! claim CAS rejects concurrent duplicates for fresh and resumed items
//! alike (Pending → Processing and Suspended → Processing are both real
//! state changes), checkpoint saves are last-write-wins under a single
//! claimed writer, and result recording is keyed by queue id.

use crate::assigner::{AssignProgress, RatePoolAssigner};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::{CheckpointFallback, EngineConfig};
use crate::error::{EngineError, Result};
use crate::progress::ProgressSink;
use crate::store::EngineStore;
use crate::types::{
    DeviceGroup, InstanceStatus, OptimizationInstance, QueueItem, QueueStatus, WorkItem,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// In-memory message queue with at-least-once semantics (a pushed item can
/// be pushed again by the caller to model redelivery)
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: WorkItem) {
        self.items.lock().expect("work queue lock poisoned").push_back(item);
    }

    pub fn dequeue(&self) -> Option<WorkItem> {
        self.items.lock().expect("work queue lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("work queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What processing one work item produced
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Queue fully evaluated and recorded
    Completed { queue_id: u64, total_cost: f64 },
    /// Budget ran out; checkpoint saved and continuation enqueued
    Continued { queue_id: u64 },
    /// Lost the claim race to another delivery of the same item
    Duplicate { queue_id: u64 },
    /// Queue moved to Error (validation failure or exhausted fallback)
    Failed { queue_id: u64 },
    /// Continuation batch expanded into new queues under a follow-up instance
    BatchExpanded { instance_id: u64, queue_count: usize },
}

/// Stateless worker over a store, checkpoint store, and work queue
pub struct Dispatcher {
    store: Arc<dyn EngineStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: Arc<dyn ProgressSink>,
    queue: Arc<WorkQueue>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EngineStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: Arc<dyn ProgressSink>,
        queue: Arc<WorkQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            checkpoints,
            progress,
            queue,
            config,
        }
    }

    /// Drain the work queue, retrying transient failures per item with
    /// exponential backoff up to the configured ceiling.
    pub async fn run_until_idle(&self) -> Result<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::new();

        while let Some(item) = self.queue.dequeue() {
            let mut attempt = 0u32;
            loop {
                match self.process(item.clone()).await {
                    Ok(outcome) => {
                        outcomes.push(outcome);
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.config.transient_retry_limit => {
                        let backoff = self.config.transient_initial_backoff * 2u32.pow(attempt);
                        warn!(attempt, error = %e, "transient failure, retrying work item");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "work item failed");
                        if let WorkItem::Evaluate { queue_id, .. } = &item {
                            self.store.mark_queue_error(*queue_id).await?;
                            outcomes.push(ProcessOutcome::Failed { queue_id: *queue_id });
                        }
                        break;
                    }
                }
            }
        }

        Ok(outcomes)
    }

    /// Process a single work item.
    pub async fn process(&self, item: WorkItem) -> Result<ProcessOutcome> {
        match item {
            WorkItem::Evaluate {
                queue_id,
                group_id,
                time_budget_ms,
                resume,
            } => {
                self.evaluate(queue_id, group_id, Duration::from_millis(time_budget_ms), resume)
                    .await
            }
            WorkItem::SequenceBatch { group_id, sequences } => {
                self.expand_batch(group_id, sequences).await
            }
        }
    }

    async fn evaluate(
        &self,
        queue_id: u64,
        group_id: u64,
        budget: Duration,
        resume: bool,
    ) -> Result<ProcessOutcome> {
        let queue = self.store.queue(queue_id).await?;

        // Claim the queue. Fresh items claim Pending, continuations claim
        // Suspended; both are real state changes, so the second of two
        // concurrent deliveries always loses the race.
        let expected = if resume {
            QueueStatus::Suspended
        } else {
            QueueStatus::Pending
        };
        if !self
            .store
            .try_transition_queue(queue_id, expected, QueueStatus::Processing)
            .await?
        {
            info!(queue_id, "duplicate delivery lost the claim race, skipping");
            return Ok(ProcessOutcome::Duplicate { queue_id });
        }

        let data = self.store.group_data(group_id).await?;
        let sequence = self.store.sequence(queue.sequence_id).await?;
        let key = CheckpointKey::new(queue_id, group_id, queue.sequence_id);

        let prior = if resume {
            let loaded = self.checkpoints.load(key).await?;
            if loaded.is_none() {
                // Checkpoint already consumed (or lost); restart from scratch
                // rather than fail — the run is idempotent either way.
                warn!(queue_id, "resume requested but no checkpoint found, restarting");
            }
            loaded
        } else {
            None
        };

        let assigner = match RatePoolAssigner::new(
            &data.devices,
            &data.plans,
            &sequence,
            self.config.proration,
        ) {
            Ok(assigner) => assigner,
            Err(e @ EngineError::Validation(_)) | Err(e @ EngineError::NotFound { .. }) => {
                warn!(queue_id, error = %e, "queue rejected by validation");
                self.store.mark_queue_error(queue_id).await?;
                return Ok(ProcessOutcome::Failed { queue_id });
            }
            Err(e) => return Err(e),
        };

        match assigner.run(queue_id, budget, prior)? {
            AssignProgress::Complete(outcome) => {
                self.store
                    .save_assignments(queue_id, outcome.assignments)
                    .await?;
                self.store
                    .record_queue_result(queue_id, outcome.total_cost, outcome.strategy_used)
                    .await?;
                self.checkpoints.delete(key).await?;
                self.report_queue_progress(&queue, data.devices.len()).await;

                debug!(queue_id, total_cost = outcome.total_cost, "queue complete");
                Ok(ProcessOutcome::Completed {
                    queue_id,
                    total_cost: outcome.total_cost,
                })
            }
            AssignProgress::Suspended(checkpoint) => {
                match self.checkpoints.save(key, &checkpoint).await {
                    Ok(()) => {
                        // Release the claim into Suspended so exactly one
                        // continuation delivery can reclaim it.
                        if !self
                            .store
                            .try_transition_queue(
                                queue_id,
                                QueueStatus::Processing,
                                QueueStatus::Suspended,
                            )
                            .await?
                        {
                            return Err(EngineError::store(format!(
                                "queue {queue_id} left Processing while claimed"
                            )));
                        }
                        self.queue.enqueue(WorkItem::Evaluate {
                            queue_id,
                            group_id,
                            time_budget_ms: budget.as_millis() as u64,
                            resume: true,
                        });
                        info!(
                            queue_id,
                            remaining = checkpoint.remaining_devices(),
                            "budget exhausted, continuation enqueued"
                        );
                        Ok(ProcessOutcome::Continued { queue_id })
                    }
                    Err(save_err) => {
                        self.handle_checkpoint_failure(queue_id, checkpoint, save_err)
                            .await
                    }
                }
            }
        }
    }

    /// Checkpoint store failed mid-run: fail the queue, or finish in one
    /// shot when the remainder is small enough to fit synchronously.
    async fn handle_checkpoint_failure(
        &self,
        queue_id: u64,
        checkpoint: crate::assigner::AssignerCheckpoint,
        save_err: EngineError,
    ) -> Result<ProcessOutcome> {
        match self.config.checkpoint_fallback {
            CheckpointFallback::FailQueue => {
                error!(queue_id, error = %save_err, "checkpoint store unavailable, failing queue");
                self.store.mark_queue_error(queue_id).await?;
                Ok(ProcessOutcome::Failed { queue_id })
            }
            CheckpointFallback::FallbackIfSmall(threshold) => {
                if checkpoint.remaining_devices() <= threshold {
                    warn!(
                        queue_id,
                        remaining = checkpoint.remaining_devices(),
                        error = %save_err,
                        "checkpoint store unavailable, finishing synchronously"
                    );
                    let queue = self.store.queue(queue_id).await?;
                    let data = self.store.group_data(queue.group_id).await?;
                    let sequence = self.store.sequence(queue.sequence_id).await?;
                    let assigner = RatePoolAssigner::new(
                        &data.devices,
                        &data.plans,
                        &sequence,
                        self.config.proration,
                    )?;
                    match assigner.run(queue_id, Duration::MAX, Some(checkpoint))? {
                        AssignProgress::Complete(outcome) => {
                            self.store
                                .save_assignments(queue_id, outcome.assignments)
                                .await?;
                            self.store
                                .record_queue_result(
                                    queue_id,
                                    outcome.total_cost,
                                    outcome.strategy_used,
                                )
                                .await?;
                            Ok(ProcessOutcome::Completed {
                                queue_id,
                                total_cost: outcome.total_cost,
                            })
                        }
                        AssignProgress::Suspended(_) => Err(EngineError::checkpoint(
                            "synchronous fallback run suspended under an unbounded budget",
                        )),
                    }
                } else {
                    error!(
                        queue_id,
                        remaining = checkpoint.remaining_devices(),
                        threshold,
                        "checkpoint store unavailable and remainder too large, failing queue"
                    );
                    self.store.mark_queue_error(queue_id).await?;
                    Ok(ProcessOutcome::Failed { queue_id })
                }
            }
        }
    }

    /// Persist a continuation batch of sequences under a follow-up instance
    /// and fan out their queues. The successor instance keeps the deferred
    /// queues out of an instance the monitor may already have finalized.
    async fn expand_batch(
        &self,
        group_id: u64,
        sequences: Vec<crate::types::PlanSequence>,
    ) -> Result<ProcessOutcome> {
        let count = sequences.len();
        let prior_group = self.store.group(group_id).await?;
        let prior_instance = self.store.instance(prior_group.instance_id).await?;

        let base = self.store.reserve_ids(2 + count as u64).await?;
        let instance_id = base;
        let new_group_id = base + 1;
        let first_queue_id = base + 2;

        let mut instance = OptimizationInstance::new(
            instance_id,
            prior_instance.session_id,
            prior_instance.portal_type,
        );
        instance.device_count_expected = prior_instance.device_count_expected;
        instance.status = InstanceStatus::Processing;
        self.store.insert_instance(instance).await?;
        self.store
            .insert_group(DeviceGroup {
                id: new_group_id,
                instance_id,
                kind: prior_group.kind,
            })
            .await?;
        self.store.clone_group_data(group_id, new_group_id).await?;

        let sequences: Vec<crate::types::PlanSequence> = sequences
            .into_iter()
            .map(|mut seq| {
                seq.group_id = new_group_id;
                seq
            })
            .collect();
        let queues: Vec<QueueItem> = sequences
            .iter()
            .enumerate()
            .map(|(i, seq)| QueueItem::new(first_queue_id + i as u64, new_group_id, seq.id))
            .collect();

        self.store.insert_sequences(sequences).await?;
        self.store.insert_queues(queues.clone()).await?;

        for queue in &queues {
            self.queue.enqueue(WorkItem::Evaluate {
                queue_id: queue.id,
                group_id: new_group_id,
                time_budget_ms: self.config.time_budget.as_millis() as u64,
                resume: false,
            });
        }

        info!(
            group_id,
            instance_id,
            queue_count = count,
            "continuation batch expanded under follow-up instance"
        );
        Ok(ProcessOutcome::BatchExpanded {
            instance_id,
            queue_count: count,
        })
    }

    /// Fire-and-forget per-queue progress callback.
    async fn report_queue_progress(&self, queue: &QueueItem, device_count: usize) {
        let session = async {
            let group = self.store.group(queue.group_id).await?;
            let instance = self.store.instance(group.instance_id).await?;
            let session = self.store.session(instance.session_id).await?;
            // The just-finished queue is already Complete, so the terminal
            // count includes it.
            let queues = self.store.queues_for_instance(instance.id).await?;
            let done = queues.iter().filter(|q| q.status.is_terminal()).count();
            Ok::<_, EngineError>((session, done, queues.len()))
        }
        .await;

        match session {
            Ok((session, done, total)) => {
                let percent = if total == 0 {
                    100.0
                } else {
                    done.min(total) as f64 / total as f64 * 100.0
                };
                self.progress.report_progress(
                    session.id,
                    session.guid,
                    device_count,
                    percent,
                    &format!("queue {} complete", queue.id),
                );
            }
            Err(e) => debug!(error = %e, "progress lookup failed (ignored)"),
        }
    }
}
