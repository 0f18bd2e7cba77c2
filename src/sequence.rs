//! Candidate rate-plan sequence generation
//!
//! A sequence is one ordering of a group's eligible plans; assignment walks
//! pools in sequence order, so distinct orderings genuinely explore different
//! greedy outcomes. Two modes:
//!
//! - **Plain**: every distinct ordering of the eligible set (`k!` for `k`
//!   plans), deduplicated.
//! - **Type-partitioned**: permute within each `type_id` partition and
//!   concatenate across partitions in ascending type order, so no sequence
//!   interleaves pools that no single device could span.
//!
//! Output is deterministic for a given input order: permutations are emitted
//! in lexicographic index order, which keeps redelivered generation requests
//! idempotent and batch boundaries stable.

use crate::error::{EngineError, Result};
use crate::types::{PlanSequence, RatePlan, WorkItem};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which permutation mode a group needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermutationMode {
    /// Flat group: permute the whole eligible set
    Plain,
    /// Heterogeneous group: permute within type partitions
    TypePartitioned,
}

/// Generator output: sequences for this instance plus an optional
/// continuation for everything past the batch limit
#[derive(Debug)]
pub struct GeneratedSequences {
    pub sequences: Vec<PlanSequence>,
    pub continuation: Option<WorkItem>,
}

/// Sequence generator for one device group
pub struct SequenceGenerator {
    rate_plan_limit: usize,
    batch_limit: usize,
}

impl SequenceGenerator {
    pub fn new(rate_plan_limit: usize, batch_limit: usize) -> Self {
        Self {
            rate_plan_limit,
            batch_limit,
        }
    }

    /// Filter plans down to the eligible set.
    ///
    /// Plans with non-positive overage economics are rejected here, before
    /// any counting or permutation; an empty result or an over-limit result
    /// is a hard validation failure.
    pub fn eligible_plans<'a>(&self, plans: &'a [RatePlan]) -> Result<Vec<&'a RatePlan>> {
        let eligible: Vec<&RatePlan> = plans.iter().filter(|p| p.has_valid_overage()).collect();

        if eligible.is_empty() {
            return Err(EngineError::validation(
                "no eligible rate plans (all failed positive-overage check)",
            ));
        }
        if eligible.len() > self.rate_plan_limit {
            return Err(EngineError::validation(format!(
                "eligible plan count {} exceeds rate plan limit {}",
                eligible.len(),
                self.rate_plan_limit
            )));
        }

        Ok(eligible)
    }

    /// Generate all sequences for a group.
    ///
    /// `next_sequence_id` seeds sequence ids; ids are assigned in emission
    /// order so the id ordering matches the deterministic output ordering.
    pub fn generate(
        &self,
        group_id: u64,
        plans: &[RatePlan],
        mode: PermutationMode,
        next_sequence_id: u64,
    ) -> Result<GeneratedSequences> {
        let eligible = self.eligible_plans(plans)?;

        let orderings = match mode {
            PermutationMode::Plain => {
                let ids: Vec<u64> = eligible.iter().map(|p| p.id).collect();
                permute_distinct(&ids)
            }
            PermutationMode::TypePartitioned => {
                // BTreeMap keeps partition order stable by type id
                let mut by_type: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
                for plan in &eligible {
                    by_type.entry(plan.type_id).or_default().push(plan.id);
                }
                combine_partitions(&by_type)
            }
        };

        debug!(
            group_id,
            eligible = eligible.len(),
            sequences = orderings.len(),
            ?mode,
            "generated plan orderings"
        );

        let mut sequences: Vec<PlanSequence> = orderings
            .into_iter()
            .enumerate()
            .map(|(order, rate_plan_ids)| PlanSequence {
                id: next_sequence_id + order as u64,
                group_id,
                rate_plan_ids,
                order,
            })
            .collect();

        // Everything past the batch limit continues in a follow-up instance,
        // bounding the unit of work regardless of combinatorial blow-up.
        let continuation = if sequences.len() > self.batch_limit {
            let remainder = sequences.split_off(self.batch_limit);
            info!(
                group_id,
                persisted = sequences.len(),
                deferred = remainder.len(),
                "sequence count exceeds batch limit, emitting continuation"
            );
            Some(WorkItem::SequenceBatch {
                group_id,
                sequences: remainder,
            })
        } else {
            None
        };

        Ok(GeneratedSequences {
            sequences,
            continuation,
        })
    }
}

/// All distinct permutations of `ids`, in lexicographic index order.
///
/// Duplicate plan ids collapse duplicate orderings, so the output is a set.
fn permute_distinct(ids: &[u64]) -> Vec<Vec<u64>> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = Vec::with_capacity(ids.len());
    let mut used = vec![false; ids.len()];
    permute_rec(ids, &mut used, &mut current, &mut seen, &mut out);
    out
}

fn permute_rec(
    ids: &[u64],
    used: &mut [bool],
    current: &mut Vec<u64>,
    seen: &mut std::collections::HashSet<Vec<u64>>,
    out: &mut Vec<Vec<u64>>,
) {
    if current.len() == ids.len() {
        if seen.insert(current.clone()) {
            out.push(current.clone());
        }
        return;
    }
    for i in 0..ids.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        current.push(ids[i]);
        permute_rec(ids, used, current, seen, out);
        current.pop();
        used[i] = false;
    }
}

/// Cross-partition combination: permute each partition independently and emit
/// every concatenation, partitions in ascending type order.
fn combine_partitions(by_type: &BTreeMap<u64, Vec<u64>>) -> Vec<Vec<u64>> {
    let partition_perms: Vec<Vec<Vec<u64>>> = by_type
        .values()
        .map(|ids| permute_distinct(ids))
        .collect();

    let mut combined: Vec<Vec<u64>> = vec![Vec::new()];
    for perms in &partition_perms {
        let mut next = Vec::with_capacity(combined.len() * perms.len());
        for prefix in &combined {
            for perm in perms {
                let mut seq = prefix.clone();
                seq.extend_from_slice(perm);
                next.push(seq);
            }
        }
        combined = next;
    }
    combined
}
