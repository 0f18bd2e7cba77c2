//! Completion monitoring and winner selection
//!
//! Per-instance state machine:
//!
//! ```text
//! WaitingForQueues ──(all queues terminal)──► AllComplete ──► Finalized
//!        │
//!        └──(retry ceiling exhausted)──► TimedOut
//! ```
//!
//! The poll loop backs off exponentially and gives up after a fixed attempt
//! ceiling; exhaustion is an operator-visible failure and the instance is
//! left un-finalized — winner selection never runs over a partially
//! complete queue set.
//!
//! Finalization is idempotent: the instance-status compare-and-set is the
//! gate, so a redelivered finalization request detects the prior run and
//! performs no further mutation and no duplicate notification.

use crate::config::EngineConfig;
use crate::cost::baseline_total;
use crate::error::{EngineError, Result};
use crate::progress::ProgressSink;
use crate::store::EngineStore;
use crate::types::{InstanceStatus, QueueItem, QueueStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Monitor states, in the order the machine moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    WaitingForQueues,
    AllComplete,
    Finalized,
    TimedOut,
}

/// The chosen queue for one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWinner {
    pub group_id: u64,
    pub queue_id: u64,
    pub total_cost: f64,
    pub baseline_cost: f64,
    /// False when the baseline beat every candidate; assignments are then
    /// discarded and the current plans retained
    pub improved: bool,
}

/// Outcome of one monitor run
#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub instance_id: u64,
    pub state: MonitorState,
    pub winners: Vec<GroupWinner>,
    /// True when a prior invocation already finalized this instance
    pub already_finalized: bool,
    pub attempts: u32,
}

/// Watches an instance's queues and finalizes it once they all land
pub struct CompletionMonitor {
    store: Arc<dyn EngineStore>,
    progress: Arc<dyn ProgressSink>,
    config: EngineConfig,
}

impl CompletionMonitor {
    pub fn new(
        store: Arc<dyn EngineStore>,
        progress: Arc<dyn ProgressSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            progress,
            config,
        }
    }

    /// Poll until every queue for the instance is terminal, then finalize.
    pub async fn wait_and_finalize(&self, instance_id: u64) -> Result<FinalizeReport> {
        let mut attempts = 0u32;

        loop {
            let queues = self.store.queues_for_instance(instance_id).await?;
            let open = queues.iter().filter(|q| !q.status.is_terminal()).count();

            if open == 0 {
                debug!(instance_id, total = queues.len(), "all queues terminal");
                return self.finalize(instance_id, queues, attempts).await;
            }

            attempts += 1;
            if attempts >= self.config.monitor_max_attempts {
                warn!(
                    instance_id,
                    open, attempts, "monitor retry ceiling exhausted, instance left un-finalized"
                );
                self.report_instance_error(
                    instance_id,
                    &format!(
                        "completion monitor timed out with {} queues still open",
                        open
                    ),
                )
                .await;
                return Ok(FinalizeReport {
                    instance_id,
                    state: MonitorState::TimedOut,
                    winners: Vec::new(),
                    already_finalized: false,
                    attempts,
                });
            }

            let backoff = self.config.monitor_initial_backoff * 2u32.pow(attempts - 1);
            debug!(instance_id, open, attempts, ?backoff, "queues still open, backing off");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Select winners and finalize the instance. The status CAS makes this
    /// idempotent under redelivery.
    async fn finalize(
        &self,
        instance_id: u64,
        queues: Vec<QueueItem>,
        attempts: u32,
    ) -> Result<FinalizeReport> {
        let groups = self.store.groups_for_instance(instance_id).await?;

        // Every group needs at least one Complete queue for a clean finish
        let mut any_errors = false;
        let mut winners = Vec::new();
        for group in &groups {
            let group_queues: Vec<&QueueItem> =
                queues.iter().filter(|q| q.group_id == group.id).collect();
            if group_queues.iter().any(|q| q.status == QueueStatus::Error) {
                any_errors = true;
            }
            if let Some(winner) = select_winner(&group_queues) {
                let data = self.store.group_data(group.id).await?;
                let baseline = baseline_total(&data.devices);
                let total_cost = winner.total_cost.unwrap_or(f64::INFINITY);
                winners.push(GroupWinner {
                    group_id: group.id,
                    queue_id: winner.id,
                    total_cost,
                    baseline_cost: baseline,
                    improved: total_cost <= baseline,
                });
            } else {
                any_errors = true;
            }
        }

        let final_status = if any_errors {
            InstanceStatus::CompleteWithErrors
        } else {
            InstanceStatus::Completed
        };

        // Idempotence gate: only the first finalizer mutates and notifies.
        if !self
            .store
            .try_finalize_instance(instance_id, final_status)
            .await?
        {
            info!(instance_id, "instance already finalized, skipping");
            return Ok(FinalizeReport {
                instance_id,
                state: MonitorState::Finalized,
                winners,
                already_finalized: true,
                attempts,
            });
        }

        // Data minimization: only the winning mapping per group survives.
        // A no-improvement winner keeps nothing — the baseline stands.
        for queue in &queues {
            let keep = winners
                .iter()
                .any(|w| w.queue_id == queue.id && w.improved);
            if !keep {
                self.store.delete_assignments(queue.id).await?;
            }
        }

        for winner in &winners {
            if winner.improved {
                info!(
                    instance_id,
                    group_id = winner.group_id,
                    queue_id = winner.queue_id,
                    total_cost = winner.total_cost,
                    baseline = winner.baseline_cost,
                    "winner selected"
                );
            } else {
                info!(
                    instance_id,
                    group_id = winner.group_id,
                    total_cost = winner.total_cost,
                    baseline = winner.baseline_cost,
                    "no improvement over baseline, retaining current plans"
                );
            }
        }

        if any_errors {
            self.report_instance_error(
                instance_id,
                "instance finalized with errors; one or more queues failed",
            )
            .await;
        } else {
            self.report_instance_done(instance_id).await;
        }

        Ok(FinalizeReport {
            instance_id,
            state: MonitorState::Finalized,
            winners,
            already_finalized: false,
            attempts,
        })
    }

    async fn report_instance_error(&self, instance_id: u64, message: &str) {
        if let Ok(instance) = self.store.instance(instance_id).await {
            self.progress.report_error(instance.session_id, message);
        }
    }

    async fn report_instance_done(&self, instance_id: u64) {
        let lookup = async {
            let instance = self.store.instance(instance_id).await?;
            let session = self.store.session(instance.session_id).await?;
            Ok::<_, EngineError>((instance, session))
        }
        .await;
        if let Ok((instance, session)) = lookup {
            self.progress.report_progress(
                session.id,
                session.guid,
                instance.device_count_expected,
                100.0,
                "instance finalized",
            );
        }
    }
}

/// Winner = the Complete queue with minimum total cost; ties go to the
/// lowest queue id. Queues without a recorded cost never win.
fn select_winner<'a>(queues: &[&'a QueueItem]) -> Option<&'a QueueItem> {
    queues
        .iter()
        .filter(|q| q.status == QueueStatus::Complete && q.total_cost.is_some())
        .min_by(|a, b| {
            let ca = a.total_cost.unwrap_or(f64::INFINITY);
            let cb = b.total_cost.unwrap_or(f64::INFINITY);
            ca.partial_cmp(&cb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::STRATEGY_MATRIX;
    use crate::progress::{ChannelSink, ProgressEvent};
    use crate::store::MemoryStore;
    use crate::types::{
        Assignment, BillingPeriod, Device, DeviceGroup, GroupKind, OptimizationInstance,
        PortalType, RatePlan, Session,
    };
    use chrono::NaiveDate;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default().with_monitor_retries(3, Duration::from_millis(1))
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        monitor: CompletionMonitor,
        events: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
    }

    async fn fixture(baseline_each: f64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (sink, events) = ChannelSink::new();

        let period = BillingPeriod::new(
            1,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        );
        store.insert_session(Session::new(1, 42, period)).await.unwrap();
        let mut instance = OptimizationInstance::new(2, 1, PortalType::M2m);
        instance.status = InstanceStatus::Processing;
        store.insert_instance(instance).await.unwrap();
        store
            .insert_group(DeviceGroup {
                id: 3,
                instance_id: 2,
                kind: GroupKind::OptimizationGroup,
            })
            .await
            .unwrap();
        store.put_group_data(
            3,
            vec![
                Device::new(1, 100.0, 1).with_baseline(baseline_each),
                Device::new(2, 100.0, 1).with_baseline(baseline_each),
            ],
            vec![RatePlan::new(1, 1, 10.0, 1000.0).with_overage(0.02, 1.0)],
        );

        let monitor = CompletionMonitor::new(store.clone(), Arc::new(sink), config());
        Fixture {
            store,
            monitor,
            events,
        }
    }

    async fn complete_queue(store: &MemoryStore, queue_id: u64, cost: f64) {
        store
            .insert_queues(vec![QueueItem::new(queue_id, 3, 100 + queue_id)])
            .await
            .unwrap();
        store
            .save_assignments(
                queue_id,
                vec![Assignment {
                    queue_id,
                    device_id: 1,
                    rate_pool_index: 0,
                    computed_cost: cost,
                }],
            )
            .await
            .unwrap();
        store
            .record_queue_result(queue_id, cost, STRATEGY_MATRIX[0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_winner_minimum_cost_purges_losers() {
        let mut fx = fixture(100.0).await;
        complete_queue(&fx.store, 10, 30.0).await;
        complete_queue(&fx.store, 11, 20.0).await;
        complete_queue(&fx.store, 12, 25.0).await;

        let report = fx.monitor.wait_and_finalize(2).await.unwrap();

        assert_eq!(report.state, MonitorState::Finalized);
        assert!(!report.already_finalized);
        assert_eq!(report.winners.len(), 1);
        assert_eq!(report.winners[0].queue_id, 11);
        assert!(report.winners[0].improved);

        // Losers purged, winner retained
        assert!(fx.store.assignments_for_queue(10).await.unwrap().is_empty());
        assert!(!fx.store.assignments_for_queue(11).await.unwrap().is_empty());
        assert!(fx.store.assignments_for_queue(12).await.unwrap().is_empty());

        assert_eq!(
            fx.store.instance(2).await.unwrap().status,
            InstanceStatus::Completed
        );
        match fx.events.recv().await.unwrap() {
            ProgressEvent::Progress { percent, .. } => assert_eq!(percent, 100.0),
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tie_breaks_to_lowest_queue_id() {
        let fx = fixture(100.0).await;
        complete_queue(&fx.store, 11, 20.0).await;
        complete_queue(&fx.store, 10, 20.0).await;

        let report = fx.monitor.wait_and_finalize(2).await.unwrap();
        assert_eq!(report.winners[0].queue_id, 10);
    }

    #[tokio::test]
    async fn test_refinalization_is_idempotent() {
        let fx = fixture(100.0).await;
        complete_queue(&fx.store, 10, 30.0).await;
        complete_queue(&fx.store, 11, 20.0).await;

        let first = fx.monitor.wait_and_finalize(2).await.unwrap();
        assert!(!first.already_finalized);
        let winner_rows = fx.store.assignments_for_queue(11).await.unwrap();

        let second = fx.monitor.wait_and_finalize(2).await.unwrap();
        assert!(second.already_finalized);
        assert_eq!(second.winners, first.winners);
        // No further mutation
        assert_eq!(
            fx.store.assignments_for_queue(11).await.unwrap(),
            winner_rows
        );
    }

    #[tokio::test]
    async fn test_timeout_leaves_instance_unfinalized() {
        let mut fx = fixture(100.0).await;
        // One queue that never leaves Pending
        fx.store
            .insert_queues(vec![QueueItem::new(10, 3, 110)])
            .await
            .unwrap();

        let report = fx.monitor.wait_and_finalize(2).await.unwrap();

        assert_eq!(report.state, MonitorState::TimedOut);
        assert_eq!(report.attempts, 3);
        assert_eq!(
            fx.store.instance(2).await.unwrap().status,
            InstanceStatus::Processing
        );
        match fx.events.recv().await.unwrap() {
            ProgressEvent::Error { message, .. } => assert!(message.contains("timed out")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_queue_finalizes_with_errors_and_one_notification() {
        let mut fx = fixture(100.0).await;
        complete_queue(&fx.store, 10, 30.0).await;
        fx.store
            .insert_queues(vec![QueueItem::new(11, 3, 111)])
            .await
            .unwrap();
        fx.store.mark_queue_error(11).await.unwrap();

        let report = fx.monitor.wait_and_finalize(2).await.unwrap();
        assert_eq!(report.state, MonitorState::Finalized);
        assert_eq!(
            fx.store.instance(2).await.unwrap().status,
            InstanceStatus::CompleteWithErrors
        );

        // Exactly one error notification, even after a redelivered run
        fx.monitor.wait_and_finalize(2).await.unwrap();
        match fx.events.recv().await.unwrap() {
            ProgressEvent::Error { .. } => {}
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_improvement_retains_baseline() {
        let fx = fixture(5.0).await; // baseline total = 10.0
        complete_queue(&fx.store, 10, 30.0).await; // worse than baseline

        let report = fx.monitor.wait_and_finalize(2).await.unwrap();

        assert!(!report.winners[0].improved);
        // Winner's assignments discarded; current plans stand
        assert!(fx.store.assignments_for_queue(10).await.unwrap().is_empty());
    }
}
