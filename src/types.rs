//! Core types for the optimization engine
//!
//! The ownership chain is strict: Session → Instance → Group → Sequence →
//! Queue. Devices and rate plans are read-only inputs borrowed by a group for
//! the duration of a run; the engine never mutates them. Assignments are
//! derived rows, kept only for the winning queue of each group.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session terminal/non-terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    /// An error-terminal session no longer blocks new sessions for the tenant.
    pub fn is_error_terminal(&self) -> bool {
        matches!(self, SessionStatus::Failed)
    }
}

/// Execution shard kind (which portal's devices this instance covers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortalType {
    M2m,
    Mobility,
    CrossProvider,
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Created,
    Processing,
    CompleteWithErrors,
    Completed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::CompleteWithErrors | InstanceStatus::Completed
        )
    }
}

/// Queue work-item status. Transitions are forward-only, except the
/// suspend/resume loop between Processing and Suspended. Both claim
/// transitions (Pending → Processing, Suspended → Processing) are genuine
/// state changes, so a redelivered duplicate always loses the claim race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Processing,
    /// Budget ran out mid-evaluation; a checkpoint holds the partial state
    /// and a continuation item will reclaim the queue
    Suspended,
    Complete,
    Error,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Complete | QueueStatus::Error)
    }
}

/// One optimization attempt for a tenant and billing period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    /// External correlation key (progress callbacks, operator tooling)
    pub guid: Uuid,
    pub tenant_id: u64,
    pub billing_period: BillingPeriod,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: u64, tenant_id: u64, billing_period: BillingPeriod) -> Self {
        Session {
            id,
            guid: Uuid::new_v4(),
            tenant_id,
            billing_period,
            status: SessionStatus::Created,
            created_at: Utc::now(),
        }
    }
}

/// A billing window in the tenant's local calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: u64,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(id: u64, start: NaiveDate, end: NaiveDate) -> Self {
        BillingPeriod { id, start, end }
    }

    /// Whether `today` is the last local calendar day of the period
    pub fn is_final_day(&self, today: NaiveDate) -> bool {
        today == self.end
    }

    /// Days covered by the window, inclusive of both endpoints
    pub fn days(&self) -> u32 {
        (self.end - self.start).num_days().max(0) as u32 + 1
    }
}

/// An execution shard of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationInstance {
    pub id: u64,
    pub session_id: u64,
    pub portal_type: PortalType,
    pub device_count_expected: usize,
    pub status: InstanceStatus,
}

impl OptimizationInstance {
    pub fn new(id: u64, session_id: u64, portal_type: PortalType) -> Self {
        OptimizationInstance {
            id,
            session_id,
            portal_type,
            device_count_expected: 0,
            status: InstanceStatus::Created,
        }
    }
}

/// How a group's devices were partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    /// Devices sharing one communication plan
    SharedCommunicationPlan,
    /// Devices compatible by optimization group + rate-plan type
    OptimizationGroup,
}

/// A partition of devices that must be jointly evaluated.
/// Owns its candidate rate-plan set; borrows its device snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: u64,
    pub instance_id: u64,
    pub kind: GroupKind,
}

/// Immutable rate-plan reference data for the run.
///
/// Plans with non-positive overage economics are rejected before sequence
/// generation; see [`RatePlan::has_valid_overage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePlan {
    pub id: u64,
    /// Plan type; devices are only eligible for plans of their own type
    pub type_id: u64,
    pub monthly_rate: f64,
    pub included_data_mb: f64,
    pub overage_rate_per_unit: f64,
    pub data_per_overage_charge: f64,
    /// Pooling plans share their allowance across all devices in the pool
    pub allows_pooling: bool,
}

impl RatePlan {
    pub fn new(id: u64, type_id: u64, monthly_rate: f64, included_data_mb: f64) -> Self {
        RatePlan {
            id,
            type_id,
            monthly_rate,
            included_data_mb,
            overage_rate_per_unit: 0.0,
            data_per_overage_charge: 0.0,
            allows_pooling: false,
        }
    }

    /// Set overage pricing
    pub fn with_overage(mut self, rate_per_unit: f64, data_per_charge: f64) -> Self {
        self.overage_rate_per_unit = rate_per_unit;
        self.data_per_overage_charge = data_per_charge;
        self
    }

    /// Mark the plan as pooling
    pub fn with_pooling(mut self) -> Self {
        self.allows_pooling = true;
        self
    }

    /// Both overage terms must be strictly positive for the plan to enter
    /// sequence generation.
    pub fn has_valid_overage(&self) -> bool {
        self.overage_rate_per_unit > 0.0 && self.data_per_overage_charge > 0.0
    }
}

/// One permutation of a group's eligible rate plans; the unit of evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSequence {
    pub id: u64,
    pub group_id: u64,
    /// Ordered plan ids; order is the pool preference order during assignment
    pub rate_plan_ids: Vec<u64>,
    /// Position within the generator's output (stable across runs)
    pub order: usize,
}

/// Unit of work: one sequence evaluated against one group's devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: u64,
    pub group_id: u64,
    pub sequence_id: u64,
    pub status: QueueStatus,
    /// Best total cost found by the assigner (set on Complete)
    pub total_cost: Option<f64>,
    /// Which of the four strategies produced the best cost
    pub strategy_used: Option<crate::assigner::StrategyKind>,
}

impl QueueItem {
    pub fn new(id: u64, group_id: u64, sequence_id: u64) -> Self {
        QueueItem {
            id,
            group_id,
            sequence_id,
            status: QueueStatus::Pending,
            total_cost: None,
            strategy_used: None,
        }
    }
}

/// Immutable usage snapshot of one device for the billing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub usage_mb: f64,
    pub current_rate_plan_id: u64,
    /// Cost of staying on the current plan (computed once, never regressed past)
    pub baseline_cost: f64,
    /// Rate-plan type the device is eligible for
    pub type_id: u64,
    /// Carrier communication plan, used by the ByCommunicationPlan strategy
    pub communication_plan: String,
}

impl Device {
    pub fn new(id: u64, usage_mb: f64, current_rate_plan_id: u64) -> Self {
        Device {
            id,
            usage_mb,
            current_rate_plan_id,
            baseline_cost: 0.0,
            type_id: 0,
            communication_plan: String::new(),
        }
    }

    pub fn with_baseline(mut self, baseline_cost: f64) -> Self {
        self.baseline_cost = baseline_cost;
        self
    }

    pub fn with_type(mut self, type_id: u64) -> Self {
        self.type_id = type_id;
        self
    }

    pub fn with_communication_plan(mut self, plan: impl Into<String>) -> Self {
        self.communication_plan = plan.into();
        self
    }
}

/// Derived device→pool mapping for one queue; deleted for all losing queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub queue_id: u64,
    pub device_id: u64,
    /// Index into the winning sequence's pool list
    pub rate_pool_index: usize,
    pub computed_cost: f64,
}

/// Inbound message-queue payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkItem {
    /// Evaluate (or resume evaluating) one queue
    Evaluate {
        queue_id: u64,
        group_id: u64,
        time_budget_ms: u64,
        resume: bool,
    },
    /// Continuation carrying sequences that didn't fit the batch limit;
    /// processed by a follow-up instance
    SequenceBatch {
        group_id: u64,
        sequences: Vec<PlanSequence>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_plan_overage_validity() {
        let plan = RatePlan::new(1, 1, 20.0, 1000.0);
        assert!(!plan.has_valid_overage());

        let plan = plan.with_overage(0.05, 1.0);
        assert!(plan.has_valid_overage());

        let bad = RatePlan::new(2, 1, 20.0, 1000.0).with_overage(-0.01, 1.0);
        assert!(!bad.has_valid_overage());
    }

    #[test]
    fn test_billing_period_final_day() {
        let period = BillingPeriod::new(
            1,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        );

        assert!(period.is_final_day(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()));
        assert!(!period.is_final_day(NaiveDate::from_ymd_opt(2024, 3, 30).unwrap()));
        assert_eq!(period.days(), 31);
    }

    #[test]
    fn test_queue_status_terminality() {
        assert!(QueueStatus::Complete.is_terminal());
        assert!(QueueStatus::Error.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(!QueueStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_work_item_serialization() {
        let item = WorkItem::Evaluate {
            queue_id: 7,
            group_id: 3,
            time_budget_ms: 5000,
            resume: false,
        };

        let json = serde_json::to_string(&item).unwrap();
        let parsed: WorkItem = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkItem::Evaluate { queue_id, resume, .. } => {
                assert_eq!(queue_id, 7);
                assert!(!resume);
            }
            _ => panic!("expected Evaluate"),
        }
    }
}
