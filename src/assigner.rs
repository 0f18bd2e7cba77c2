//! Rate pool assignment
//!
//! For one queue (one sequence × one group's devices) the assigner evaluates
//! a 4-strategy matrix — grouping {None, ByCommunicationPlan} × device order
//! {LargestUsageFirst, SmallestUsageFirst} — and keeps the minimum-total-cost
//! result.
//!
//! Placement is greedy by **marginal** cost: a device goes to the pool whose
//! running total increases least, not the pool that would be cheapest for the
//! device standalone. Pooling plans accumulate usage across devices and price
//! overage on the cumulative total against the shared allowance, so the
//! marginal overage of a device depends on everything placed before it.
//!
//! The assigner is time-bounded. When the wall-clock budget runs out
//! mid-strategy it returns a serializable [`AssignerCheckpoint`] instead of
//! aborting; a later invocation resumes from exactly that state. At least one
//! device is processed per invocation, so resumption always makes progress.

use crate::cost::{overage_cost, ChargeType, Proration, plan_cost};
use crate::error::{EngineError, Result};
use crate::types::{Assignment, Device, PlanSequence, RatePlan};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Checkpoint schema version; bump on any layout change
pub const CHECKPOINT_VERSION: u32 = 1;

/// How devices are partitioned before pool assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupingStrategy {
    /// One shared pool set for the whole group
    None,
    /// Separate pool sets per carrier communication plan
    ByCommunicationPlan,
}

/// Order in which devices are offered to pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceOrder {
    LargestUsageFirst,
    SmallestUsageFirst,
}

/// One cell of the strategy matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyKind {
    pub grouping: GroupingStrategy,
    pub order: DeviceOrder,
}

/// The full matrix, in evaluation order. Ties on total cost keep the
/// earlier entry, so this order is part of the engine's determinism.
pub const STRATEGY_MATRIX: [StrategyKind; 4] = [
    StrategyKind {
        grouping: GroupingStrategy::None,
        order: DeviceOrder::LargestUsageFirst,
    },
    StrategyKind {
        grouping: GroupingStrategy::None,
        order: DeviceOrder::SmallestUsageFirst,
    },
    StrategyKind {
        grouping: GroupingStrategy::ByCommunicationPlan,
        order: DeviceOrder::LargestUsageFirst,
    },
    StrategyKind {
        grouping: GroupingStrategy::ByCommunicationPlan,
        order: DeviceOrder::SmallestUsageFirst,
    },
];

/// Running usage state of one pool (one sequence position)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub plan_id: u64,
    pub usage_mb: f64,
    pub device_count: usize,
}

/// Pool sets keyed by partition (single empty key under `GroupingStrategy::None`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionPools {
    pub key: String,
    pub pools: Vec<PoolState>,
}

/// Result of one fully evaluated strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub strategy: StrategyKind,
    pub total_cost: f64,
    pub assignments: Vec<Assignment>,
}

/// Serialized partial progress of an in-flight assigner run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignerCheckpoint {
    pub version: u32,
    pub queue_id: u64,
    /// Index into [`STRATEGY_MATRIX`] of the strategy in flight
    pub strategy_index: usize,
    /// Devices not yet placed in the in-flight strategy, in processing order
    pub remaining_device_ids: Vec<u64>,
    /// Pool usage totals accumulated so far in the in-flight strategy
    pub partitions: Vec<PartitionPools>,
    /// Assignments made so far in the in-flight strategy
    pub partial_assignments: Vec<Assignment>,
    /// Cost accumulated so far in the in-flight strategy
    pub partial_cost: f64,
    /// Best outcome among fully evaluated strategies
    pub best: Option<StrategyOutcome>,
}

impl AssignerCheckpoint {
    /// Devices still unplaced; drives the small-remainder fallback policy
    pub fn remaining_devices(&self) -> usize {
        self.remaining_device_ids.len()
    }
}

/// Final output for one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignOutcome {
    pub total_cost: f64,
    pub assignments: Vec<Assignment>,
    pub strategy_used: StrategyKind,
    pub complete: bool,
}

/// Either a finished evaluation or a suspension point
#[derive(Debug)]
pub enum AssignProgress {
    Complete(AssignOutcome),
    /// Budget exhausted; persist this and re-enqueue with `resume = true`
    Suspended(AssignerCheckpoint),
}

/// Evaluates one sequence against one group's devices
#[derive(Debug)]
pub struct RatePoolAssigner<'a> {
    devices: &'a [Device],
    sequence: &'a PlanSequence,
    plan_map: HashMap<u64, &'a RatePlan>,
    proration: Proration,
}

impl<'a> RatePoolAssigner<'a> {
    /// Create an assigner. Fails with a validation error if the sequence is
    /// empty or references a plan missing from the eligible set.
    pub fn new(
        devices: &'a [Device],
        plans: &'a [RatePlan],
        sequence: &'a PlanSequence,
        proration: Proration,
    ) -> Result<Self> {
        if sequence.rate_plan_ids.is_empty() {
            return Err(EngineError::validation(
                "sequence has no rate plans; refusing to produce a zero-cost result",
            ));
        }
        if devices.is_empty() {
            return Err(EngineError::validation(
                "group has no devices; queue should not have been created",
            ));
        }

        let by_id: HashMap<u64, &RatePlan> = plans.iter().map(|p| (p.id, p)).collect();
        let mut plan_map = HashMap::new();
        for plan_id in &sequence.rate_plan_ids {
            let plan = by_id
                .get(plan_id)
                .ok_or_else(|| EngineError::not_found("rate plan", *plan_id))?;
            plan_map.insert(*plan_id, *plan);
        }

        Ok(Self {
            devices,
            sequence,
            plan_map,
            proration,
        })
    }

    /// Run (or resume) the evaluation under a wall-clock budget.
    pub fn run(
        &self,
        queue_id: u64,
        budget: Duration,
        resume: Option<AssignerCheckpoint>,
    ) -> Result<AssignProgress> {
        if let Some(cp) = &resume {
            if cp.version != CHECKPOINT_VERSION {
                return Err(EngineError::checkpoint(format!(
                    "checkpoint version {} does not match engine version {}",
                    cp.version, CHECKPOINT_VERSION
                )));
            }
            if cp.queue_id != queue_id {
                return Err(EngineError::checkpoint(format!(
                    "checkpoint belongs to queue {}, not {}",
                    cp.queue_id, queue_id
                )));
            }
        }

        let device_map: HashMap<u64, &Device> = self.devices.iter().map(|d| (d.id, d)).collect();
        let start = Instant::now();

        let (mut strategy_index, mut in_flight, mut best) = match resume {
            Some(cp) => {
                // An empty remaining list marks a suspension at a strategy
                // boundary; the next strategy starts fresh.
                let state = if cp.remaining_device_ids.is_empty() {
                    None
                } else {
                    Some(InFlight {
                        remaining: cp.remaining_device_ids,
                        partitions: partitions_to_map(cp.partitions),
                        assignments: cp.partial_assignments,
                        cost: cp.partial_cost,
                    })
                };
                (cp.strategy_index, state, cp.best)
            }
            None => (0, None, None),
        };

        while strategy_index < STRATEGY_MATRIX.len() {
            let strategy = STRATEGY_MATRIX[strategy_index];
            let mut state = match in_flight.take() {
                Some(state) => state,
                None => InFlight {
                    remaining: self.processing_order(strategy),
                    partitions: HashMap::new(),
                    assignments: Vec::new(),
                    cost: 0.0,
                },
            };

            while !state.remaining.is_empty() {
                let device_id = state.remaining.remove(0);
                let device = device_map
                    .get(&device_id)
                    .ok_or_else(|| EngineError::not_found("device", device_id))?;

                self.place_device(queue_id, device, strategy, &mut state)?;

                if start.elapsed() >= budget && !state.remaining.is_empty() {
                    debug!(
                        queue_id,
                        strategy_index,
                        remaining = state.remaining.len(),
                        "budget exhausted mid-strategy, suspending"
                    );
                    return Ok(AssignProgress::Suspended(AssignerCheckpoint {
                        version: CHECKPOINT_VERSION,
                        queue_id,
                        strategy_index,
                        remaining_device_ids: state.remaining,
                        partitions: partitions_from_map(state.partitions),
                        partial_assignments: state.assignments,
                        partial_cost: state.cost,
                        best,
                    }));
                }
            }

            // Strategy fully evaluated; strictly-less keeps the earlier
            // strategy on ties, which keeps output deterministic.
            let outcome = StrategyOutcome {
                strategy,
                total_cost: state.cost,
                assignments: state.assignments,
            };
            let improved = best
                .as_ref()
                .map(|b| outcome.total_cost < b.total_cost)
                .unwrap_or(true);
            if improved {
                best = Some(outcome);
            }

            strategy_index += 1;

            if start.elapsed() >= budget && strategy_index < STRATEGY_MATRIX.len() {
                return Ok(AssignProgress::Suspended(AssignerCheckpoint {
                    version: CHECKPOINT_VERSION,
                    queue_id,
                    strategy_index,
                    remaining_device_ids: Vec::new(),
                    partitions: Vec::new(),
                    partial_assignments: Vec::new(),
                    partial_cost: 0.0,
                    best,
                }));
            }
        }

        let best = best.ok_or_else(|| {
            EngineError::validation("no devices to assign; queue should not have been created")
        })?;

        Ok(AssignProgress::Complete(AssignOutcome {
            total_cost: best.total_cost,
            assignments: best.assignments,
            strategy_used: best.strategy,
            complete: true,
        }))
    }

    /// Device processing order for a strategy: partitions in sorted key
    /// order, devices within a partition by the usage ordering with id as
    /// the tiebreak.
    fn processing_order(&self, strategy: StrategyKind) -> Vec<u64> {
        let mut partitioned: Vec<(String, &Device)> = self
            .devices
            .iter()
            .map(|d| (partition_key(strategy.grouping, d), d))
            .collect();

        partitioned.sort_by(|(ka, a), (kb, b)| {
            ka.cmp(kb)
                .then_with(|| match strategy.order {
                    DeviceOrder::LargestUsageFirst => b
                        .usage_mb
                        .partial_cmp(&a.usage_mb)
                        .unwrap_or(std::cmp::Ordering::Equal),
                    DeviceOrder::SmallestUsageFirst => a
                        .usage_mb
                        .partial_cmp(&b.usage_mb)
                        .unwrap_or(std::cmp::Ordering::Equal),
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        partitioned.into_iter().map(|(_, d)| d.id).collect()
    }

    /// Place one device into the cheapest-marginal pool of its partition.
    fn place_device(
        &self,
        queue_id: u64,
        device: &Device,
        strategy: StrategyKind,
        state: &mut InFlight,
    ) -> Result<()> {
        let key = partition_key(strategy.grouping, device);
        let pools = state.partitions.entry(key).or_insert_with(|| {
            self.sequence
                .rate_plan_ids
                .iter()
                .map(|&plan_id| PoolState {
                    plan_id,
                    usage_mb: 0.0,
                    device_count: 0,
                })
                .collect()
        });

        // Candidate pools: plans matching the device's type where the group
        // is heterogeneous; all pools otherwise.
        let typed: Vec<usize> = pools
            .iter()
            .enumerate()
            .filter(|(_, p)| self.plan_map[&p.plan_id].type_id == device.type_id)
            .map(|(i, _)| i)
            .collect();
        let candidates: Vec<usize> = if typed.is_empty() {
            (0..pools.len()).collect()
        } else {
            typed
        };

        let mut chosen: Option<(usize, f64)> = None;
        for idx in candidates {
            let pool = &pools[idx];
            let plan = self.plan_map[&pool.plan_id];
            let marginal = self.marginal_cost(plan, pool, device);
            // Strict < keeps the earliest sequence position on ties
            if chosen.map(|(_, c)| marginal < c).unwrap_or(true) {
                chosen = Some((idx, marginal));
            }
        }

        let (idx, marginal) = chosen.ok_or_else(|| {
            EngineError::validation(format!("device {} has no candidate pools", device.id))
        })?;

        let pool = &mut pools[idx];
        pool.usage_mb += device.usage_mb;
        pool.device_count += 1;
        state.cost += marginal;
        state.assignments.push(Assignment {
            queue_id,
            device_id: device.id,
            rate_pool_index: idx,
            computed_cost: marginal,
        });

        Ok(())
    }

    /// Marginal cost of adding `device` to `pool`: the rate term for the new
    /// member, plus the increase in the pool's overage. Pooling plans price
    /// overage on cumulative usage against the shared allowance; non-pooling
    /// plans price the device's own usage independently.
    fn marginal_cost(&self, plan: &RatePlan, pool: &PoolState, device: &Device) -> f64 {
        let rate_term = plan_cost(plan, 0.0, ChargeType::RateChargeOnly, self.proration);
        if plan.allows_pooling {
            let before = overage_cost(plan, pool.usage_mb);
            let after = overage_cost(plan, pool.usage_mb + device.usage_mb);
            rate_term + (after - before)
        } else {
            rate_term + overage_cost(plan, device.usage_mb)
        }
    }
}

/// Mutable state of the strategy currently being evaluated
struct InFlight {
    remaining: Vec<u64>,
    partitions: HashMap<String, Vec<PoolState>>,
    assignments: Vec<Assignment>,
    cost: f64,
}

fn partition_key(grouping: GroupingStrategy, device: &Device) -> String {
    match grouping {
        GroupingStrategy::None => String::new(),
        GroupingStrategy::ByCommunicationPlan => device.communication_plan.clone(),
    }
}

fn partitions_from_map(map: HashMap<String, Vec<PoolState>>) -> Vec<PartitionPools> {
    let mut out: Vec<PartitionPools> = map
        .into_iter()
        .map(|(key, pools)| PartitionPools { key, pools })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

fn partitions_to_map(partitions: Vec<PartitionPools>) -> HashMap<String, Vec<PoolState>> {
    partitions.into_iter().map(|p| (p.key, p.pools)).collect()
}
