//! Ratewise - rate-plan assignment for metered device fleets
//!
//! ## Usage
//!
//! ```bash
//! # Full pipeline over a synthetic population (gate → sequences → assign → finalize)
//! ratewise run --devices 200 --plans 4 --seed 7
//!
//! # Force checkpointing by starving the time budget
//! ratewise run --devices 500 --plans 3 --time-budget-ms 0
//!
//! # Inspect the plan permutations a group would evaluate
//! ratewise sequences --plans 4 --by-type
//! ```

use chrono::Datelike;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use ratewise::{
    plan_cost, ChargeType, CheckpointStore, CompletionMonitor, Device, DeviceGroup, EngineConfig,
    EngineStore, GroupKind, LogSink, MemoryCheckpointStore, MemoryStore, MonitorState,
    OptimizationInstance, PermutationMode, PortalType, ProgressSink, Proration, QueueItem,
    RatePlan, Session, SessionGate, SessionStatus, WorkItem, WorkQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ratewise: combinatorial rate-plan assignment engine
#[derive(Parser)]
#[command(name = "ratewise")]
#[command(about = "Rate-plan assignment engine for metered device populations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over a synthetic device population
    Run {
        /// Number of synthetic devices
        #[arg(long, default_value_t = 50)]
        devices: usize,

        /// Number of candidate rate plans
        #[arg(long, default_value_t = 3)]
        plans: usize,

        /// Tenant the session runs under
        #[arg(long, default_value_t = 1)]
        tenant_id: u64,

        /// Per-invocation assignment time budget (0 forces checkpointing)
        #[arg(long, default_value_t = 60_000)]
        time_budget_ms: u64,

        /// RNG seed for a reproducible population
        #[arg(long)]
        seed: Option<u64>,

        /// Split plans across two type partitions and permute within each
        #[arg(long)]
        by_type: bool,

        /// Prorate rate charges to this many elapsed days
        #[arg(long)]
        proration_days: Option<u32>,
    },

    /// Print the plan sequences a group with this plan set would evaluate
    Sequences {
        /// Number of candidate rate plans
        #[arg(long, default_value_t = 3)]
        plans: usize,

        /// Split plans across two type partitions and permute within each
        #[arg(long)]
        by_type: bool,

        /// Sequences persisted per batch before a continuation is emitted
        #[arg(long, default_value_t = 1000)]
        batch_limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            devices,
            plans,
            tenant_id,
            time_budget_ms,
            seed,
            by_type,
            proration_days,
        } => {
            run_pipeline(
                devices,
                plans,
                tenant_id,
                time_budget_ms,
                seed,
                by_type,
                proration_days,
            )
            .await
        }
        Commands::Sequences {
            plans,
            by_type,
            batch_limit,
        } => print_sequences(plans, by_type, batch_limit),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    device_count: usize,
    plan_count: usize,
    tenant_id: u64,
    time_budget_ms: u64,
    seed: Option<u64>,
    by_type: bool,
    proration_days: Option<u32>,
) -> anyhow::Result<()> {
    let seed = seed.unwrap_or_else(rand::random);
    info!(seed, device_count, plan_count, "building synthetic population");

    let proration = match proration_days {
        Some(days) => Proration::Days(days),
        None => Proration::None,
    };
    let config = EngineConfig::default()
        .with_time_budget(Duration::from_millis(time_budget_ms))
        .with_proration(proration);

    let plans = demo_plans(plan_count, by_type);
    let devices = demo_devices(device_count, &plans, proration, seed);

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let progress: Arc<dyn ProgressSink> = Arc::new(LogSink::new());

    // Gate, then create the session/instance/group chain
    let today = chrono::Utc::now().date_naive();
    let period_start = today.with_day0(0).unwrap_or(today);
    let period_end = period_start
        .checked_add_months(chrono::Months::new(1))
        .and_then(|d| d.pred_opt())
        .unwrap_or(today);
    let period = ratewise::BillingPeriod::new(1, period_start, period_end);

    let gate = SessionGate::new(store.as_ref());
    let decision = gate.try_start_session(tenant_id, &period, today).await?;
    if !decision.allow {
        anyhow::bail!(
            "tenant {} already has an active session ({:?})",
            tenant_id,
            decision.running_session_id
        );
    }

    let session_id = store.reserve_ids(3).await?;
    let instance_id = session_id + 1;
    let group_id = session_id + 2;

    let session = Session::new(session_id, tenant_id, period);
    let session_guid = session.guid;
    store.insert_session(session).await?;
    store
        .set_session_status(session_id, SessionStatus::Running)
        .await?;

    let mut instance = OptimizationInstance::new(instance_id, session_id, PortalType::M2m);
    instance.device_count_expected = device_count;
    store.insert_instance(instance).await?;
    store
        .set_instance_status(instance_id, ratewise::InstanceStatus::Processing)
        .await?;

    store
        .insert_group(DeviceGroup {
            id: group_id,
            instance_id,
            kind: GroupKind::OptimizationGroup,
        })
        .await?;
    store.put_group_data(group_id, devices, plans.clone());

    // Generate sequences and fan out queues
    let mode = if by_type {
        PermutationMode::TypePartitioned
    } else {
        PermutationMode::Plain
    };
    let generator =
        ratewise::SequenceGenerator::new(config.rate_plan_limit, config.sequence_batch_limit);
    let generated = generator.generate(group_id, &plans, mode, 1)?;

    let queue = Arc::new(WorkQueue::new());
    let first_queue_id = store.reserve_ids(generated.sequences.len() as u64).await?;
    let queues: Vec<QueueItem> = generated
        .sequences
        .iter()
        .enumerate()
        .map(|(i, seq)| QueueItem::new(first_queue_id + i as u64, group_id, seq.id))
        .collect();
    store.insert_sequences(generated.sequences).await?;
    store.insert_queues(queues.clone()).await?;

    for q in &queues {
        queue.enqueue(WorkItem::Evaluate {
            queue_id: q.id,
            group_id,
            time_budget_ms,
            resume: false,
        });
    }
    if let Some(continuation) = generated.continuation {
        queue.enqueue(continuation);
    }
    info!(queues = queue.len(), "work queue seeded");

    // Drain the queue, then finalize
    let dispatcher = ratewise::Dispatcher::new(
        store.clone(),
        checkpoints,
        progress.clone(),
        queue.clone(),
        config.clone(),
    );
    let outcomes = dispatcher.run_until_idle().await?;
    info!(processed = outcomes.len(), "work queue drained");

    let monitor = CompletionMonitor::new(store.clone(), progress, config);
    let report = monitor.wait_and_finalize(instance_id).await?;

    let session_status = match report.state {
        MonitorState::Finalized => SessionStatus::Completed,
        _ => SessionStatus::Failed,
    };
    store.set_session_status(session_id, session_status).await?;
    if session_status == SessionStatus::Failed {
        warn!(session_id, state = ?report.state, "session did not finalize cleanly");
    }

    // Winner strategies come off the queue rows
    let winner_queues = futures::future::try_join_all(
        report.winners.iter().map(|w| store.queue(w.queue_id)),
    )
    .await?;

    let winners: Vec<serde_json::Value> = report
        .winners
        .iter()
        .zip(winner_queues.iter())
        .map(|(w, q)| {
            serde_json::json!({
                "group_id": w.group_id,
                "queue_id": w.queue_id,
                "total_cost": w.total_cost,
                "baseline_cost": w.baseline_cost,
                "improved": w.improved,
                "strategy": q.strategy_used,
            })
        })
        .collect();

    let summary = serde_json::json!({
        "session_id": session_id,
        "session_guid": session_guid,
        "instance_id": instance_id,
        "state": format!("{:?}", report.state),
        "monitor_attempts": report.attempts,
        "queues_evaluated": queues.len(),
        "winners": winners,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn print_sequences(plan_count: usize, by_type: bool, batch_limit: usize) -> anyhow::Result<()> {
    let plans = demo_plans(plan_count, by_type);
    let mode = if by_type {
        PermutationMode::TypePartitioned
    } else {
        PermutationMode::Plain
    };

    let generator =
        ratewise::SequenceGenerator::new(ratewise::config::DEFAULT_RATE_PLAN_LIMIT, batch_limit);
    let generated = generator.generate(1, &plans, mode, 1)?;

    for seq in &generated.sequences {
        println!("sequence {:>4}  plans {:?}", seq.order, seq.rate_plan_ids);
    }
    if let Some(WorkItem::SequenceBatch { sequences, .. }) = generated.continuation {
        println!("... {} more deferred past the batch limit", sequences.len());
    }

    Ok(())
}

/// Build a small catalog of typed rate plans with varied economics.
fn demo_plans(count: usize, by_type: bool) -> Vec<RatePlan> {
    (0..count)
        .map(|i| {
            let id = i as u64 + 1;
            let type_id = if by_type { 1 + id % 2 } else { 1 };
            let included = 250.0 * (i as f64 + 1.0);
            let rate = 8.0 + 6.0 * i as f64;
            let plan = RatePlan::new(id, type_id, rate, included).with_overage(0.05, 1.0);
            // Larger plans pool their allowance
            if i % 2 == 1 { plan.with_pooling() } else { plan }
        })
        .collect()
}

/// Sample a device population with log-normal usage, each device sitting on
/// a random current plan whose cost becomes its baseline.
fn demo_devices(
    count: usize,
    plans: &[RatePlan],
    proration: Proration,
    seed: u64,
) -> Vec<Device> {
    let mut rng = StdRng::seed_from_u64(seed);
    let usage_dist = LogNormal::new(5.5, 0.9).expect("valid log-normal parameters");
    let comm_plans = ["iot-basic", "iot-pro", "fleet-roaming"];

    (0..count)
        .map(|i| {
            let usage: f64 = usage_dist.sample(&mut rng);
            let current = &plans[rng.gen_range(0..plans.len())];
            let baseline = plan_cost(current, usage, ChargeType::RateChargeAndOverage, proration);
            Device::new(i as u64 + 1, usage, current.id)
                .with_type(current.type_id)
                .with_baseline(baseline)
                .with_communication_plan(comm_plans[rng.gen_range(0..comm_plans.len())])
        })
        .collect()
}
