//! # Ratewise
//!
//! Combinatorial rate-plan assignment for fleets of metered devices.
//!
//! ## Architecture
//!
//! ```text
//! Session (one per tenant + billing period)
//! ├── Gate            ←  blocks concurrent runs per tenant
//! └── Instance (per portal)
//!     └── Group (shared comm-plan or optimization group)
//!         ├── Sequence generator  →  plan permutations, batched
//!         └── Queue (one per sequence)
//!             ├── Dispatcher      →  CAS claim, at-least-once
//!             ├── Assigner        →  4-strategy greedy placement
//!             └── Checkpoint      →  suspend/resume under time budget
//!     └── Monitor  →  winner per group, purge losers, finalize
//! ```
//!
//! The engine evaluates every permutation of a group's eligible rate plans
//! against the group's device usage snapshot. Each permutation is one queue
//! item; the assigner places devices into plan pools one at a time by
//! marginal cost, under four grouping/ordering strategies, and keeps the
//! cheapest result. Work that outruns its time budget checkpoints and
//! resumes on redelivery; the completion monitor picks the cheapest queue
//! per group and discards every other assignment mapping.
//!
//! All work is idempotent under message redelivery: queue claims are
//! compare-and-set transitions, checkpoint keys are stable hashes of the
//! queue identity, and instance finalization runs at most once.

#![warn(clippy::all)]

pub mod assigner;
pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod error;
pub mod gate;
pub mod monitor;
pub mod progress;
pub mod sequence;
pub mod store;
pub mod types;
pub mod worker;

// Error handling
pub use error::{EngineError, Result};

// Core domain types
pub use types::{
    Assignment, BillingPeriod, Device, DeviceGroup, GroupKind, InstanceStatus,
    OptimizationInstance, PlanSequence, PortalType, QueueItem, QueueStatus, RatePlan, Session,
    SessionStatus, WorkItem,
};

// Cost model
pub use cost::{baseline_total, overage_cost, plan_cost, ChargeType, Proration};

// Configuration
pub use config::{CheckpointFallback, EngineConfig};

// Sequence generation
pub use sequence::{GeneratedSequences, PermutationMode, SequenceGenerator};

// Assignment engine
pub use assigner::{
    AssignOutcome, AssignProgress, AssignerCheckpoint, DeviceOrder, GroupingStrategy,
    RatePoolAssigner, StrategyKind, STRATEGY_MATRIX,
};

// Checkpoint persistence
pub use checkpoint::{CheckpointKey, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

// Persistence layer
pub use store::{EngineStore, GroupData, MemoryStore, TenantActivity};

// Worker loop
pub use worker::{Dispatcher, ProcessOutcome, WorkQueue};

// Session gating
pub use gate::{GateDecision, SessionGate};

// Completion monitoring
pub use monitor::{CompletionMonitor, FinalizeReport, GroupWinner, MonitorState};

// Progress reporting
pub use progress::{ChannelSink, LogSink, ProgressEvent, ProgressSink};

#[cfg(test)]
mod pipeline_tests {
    //! Full-path tests: gate → sequence generation → dispatch → finalize.

    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    struct Pipeline {
        store: Arc<MemoryStore>,
        queue: Arc<WorkQueue>,
        dispatcher: Dispatcher,
        monitor: CompletionMonitor,
    }

    fn plans() -> Vec<RatePlan> {
        vec![
            RatePlan::new(1, 1, 10.0, 500.0).with_overage(0.05, 1.0),
            RatePlan::new(2, 1, 18.0, 2000.0).with_overage(0.05, 1.0).with_pooling(),
            RatePlan::new(3, 1, 30.0, 5000.0).with_overage(0.02, 1.0).with_pooling(),
        ]
    }

    fn devices(count: u64) -> Vec<Device> {
        (1..=count)
            .map(|id| {
                let usage = 150.0 * id as f64;
                Device::new(id, usage, 1)
                    .with_type(1)
                    .with_baseline(plan_cost(
                        &plans()[0],
                        usage,
                        ChargeType::RateChargeAndOverage,
                        Proration::None,
                    ))
                    .with_communication_plan(if id % 2 == 0 { "iot-a" } else { "iot-b" })
            })
            .collect()
    }

    fn period() -> BillingPeriod {
        BillingPeriod::new(
            1,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
    }

    async fn pipeline(config: EngineConfig, device_count: u64) -> Pipeline {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WorkQueue::new());
        let progress: Arc<dyn ProgressSink> = Arc::new(LogSink::new());

        // session 1, instance 2, group 3
        store.insert_session(Session::new(1, 42, period())).await.unwrap();
        store
            .set_session_status(1, SessionStatus::Running)
            .await
            .unwrap();
        let mut instance = OptimizationInstance::new(2, 1, PortalType::M2m);
        instance.device_count_expected = device_count as usize;
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
        store.put_group_data(3, devices(device_count), plans());

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            progress.clone(),
            queue.clone(),
            config.clone(),
        );
        let monitor = CompletionMonitor::new(store.clone(), progress, config);

        Pipeline {
            store,
            queue,
            dispatcher,
            monitor,
        }
    }

    /// Generate sequences for group 3, persist them and their queues, and
    /// enqueue the evaluate items. Returns the queue count.
    async fn seed_work(p: &Pipeline, budget_ms: u64) -> usize {
        let generator = SequenceGenerator::new(
            config::DEFAULT_RATE_PLAN_LIMIT,
            config::DEFAULT_SEQUENCE_BATCH_LIMIT,
        );
        let generated = generator
            .generate(3, &plans(), PermutationMode::Plain, 1)
            .unwrap();
        assert!(generated.continuation.is_none());

        let first_queue_id = p
            .store
            .reserve_ids(generated.sequences.len() as u64)
            .await
            .unwrap();
        let queues: Vec<QueueItem> = generated
            .sequences
            .iter()
            .enumerate()
            .map(|(i, seq)| QueueItem::new(first_queue_id + i as u64, 3, seq.id))
            .collect();
        let count = queues.len();
        p.store.insert_sequences(generated.sequences).await.unwrap();
        p.store.insert_queues(queues.clone()).await.unwrap();

        for q in queues {
            p.queue.enqueue(WorkItem::Evaluate {
                queue_id: q.id,
                group_id: 3,
                time_budget_ms: budget_ms,
                resume: false,
            });
        }
        count
    }

    #[tokio::test]
    async fn test_full_pipeline_selects_winner() {
        let p = pipeline(EngineConfig::default(), 4).await;

        let gate = SessionGate::new(p.store.as_ref());
        let decision = gate
            .try_start_session(99, &period(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap())
            .await
            .unwrap();
        assert!(decision.allow);

        let queue_count = seed_work(&p, 60_000).await;
        assert_eq!(queue_count, 6); // 3! permutations

        p.dispatcher.run_until_idle().await.unwrap();
        let report = p.monitor.wait_and_finalize(2).await.unwrap();

        assert_eq!(report.state, MonitorState::Finalized);
        assert_eq!(report.winners.len(), 1);
        let winner = &report.winners[0];
        assert!(winner.total_cost.is_finite());
        // The winner never costs more than keeping every device in place
        assert!(winner.total_cost <= winner.baseline_cost || !winner.improved);

        // Exactly the winner's mapping survives
        for q in p.store.queues_for_group(3).await.unwrap() {
            let rows = p.store.assignments_for_queue(q.id).await.unwrap();
            if q.id == winner.queue_id && winner.improved {
                assert_eq!(rows.len(), 4);
            } else {
                assert!(rows.is_empty());
            }
        }
        assert_eq!(
            p.store.instance(2).await.unwrap().status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_starved_budget_pipeline_matches_unstarved_cost() {
        let relaxed = pipeline(EngineConfig::default(), 6).await;
        seed_work(&relaxed, 60_000).await;
        relaxed.dispatcher.run_until_idle().await.unwrap();
        let relaxed_report = relaxed.monitor.wait_and_finalize(2).await.unwrap();

        let starved_config =
            EngineConfig::default().with_time_budget(Duration::from_millis(0));
        let starved = pipeline(starved_config, 6).await;
        seed_work(&starved, 0).await;
        let outcomes = starved.dispatcher.run_until_idle().await.unwrap();
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ProcessOutcome::Continued { .. })));
        let starved_report = starved.monitor.wait_and_finalize(2).await.unwrap();

        assert_eq!(relaxed_report.state, MonitorState::Finalized);
        assert_eq!(starved_report.state, MonitorState::Finalized);
        assert!(
            (relaxed_report.winners[0].total_cost - starved_report.winners[0].total_cost).abs()
                < 1e-9
        );
        assert_eq!(
            relaxed_report.winners[0].queue_id,
            starved_report.winners[0].queue_id
        );
    }

    #[tokio::test]
    async fn test_redelivered_items_change_nothing() {
        let p = pipeline(EngineConfig::default(), 3).await;
        seed_work(&p, 60_000).await;

        // Redeliver every item once before processing
        let items: Vec<WorkItem> = std::iter::from_fn(|| p.queue.dequeue()).collect();
        for item in &items {
            p.queue.enqueue(item.clone());
            p.queue.enqueue(item.clone());
        }

        let outcomes = p.dispatcher.run_until_idle().await.unwrap();
        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::Completed { .. }))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::Duplicate { .. }))
            .count();
        assert_eq!(completed, items.len());
        assert_eq!(duplicates, items.len());

        let report = p.monitor.wait_and_finalize(2).await.unwrap();
        assert_eq!(report.state, MonitorState::Finalized);
        assert_eq!(report.winners.len(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocks_second_session_same_tenant() {
        let p = pipeline(EngineConfig::default(), 2).await;
        let gate = SessionGate::new(p.store.as_ref());

        // Tenant 42 has the Running session seeded by the fixture
        let decision = gate
            .try_start_session(42, &period(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap())
            .await
            .unwrap();
        assert!(!decision.allow);
        assert_eq!(decision.running_session_id, Some(1));
    }
}
