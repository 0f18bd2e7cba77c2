//! Session gate
//!
//! Per-tenant concurrency check over session creation. This is a best-effort,
//! read-then-act check with no distributed lock: the cost of falsely blocking
//! a billing-day optimization outweighs the cost of a rare duplicate run, so
//! the residual race is handled by detection and alerting downstream, not by
//! serialization here.
//!
//! The carve-out: on the billing period's last local calendar day, a new
//! session may start even while the previous one is nominally active,
//! provided that session's most recent instance reached `Completed` —
//! final-day re-optimization is worth more than strict mutual exclusion.

use crate::error::Result;
use crate::store::EngineStore;
use crate::types::{BillingPeriod, InstanceStatus};
use chrono::NaiveDate;
use tracing::{info, warn};

/// Outcome of a gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allow: bool,
    /// The session that blocked us (or that we are re-running alongside)
    pub running_session_id: Option<u64>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            running_session_id: None,
        }
    }
}

/// Session-creation gate for one store
pub struct SessionGate<'a, S: EngineStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: EngineStore + ?Sized> SessionGate<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Decide whether a new session may start for `tenant_id`, evaluated as
    /// of `today` (the tenant's local date).
    pub async fn try_start_session(
        &self,
        tenant_id: u64,
        period: &BillingPeriod,
        today: NaiveDate,
    ) -> Result<GateDecision> {
        let activity = match self.store.tenant_activity(tenant_id).await? {
            Some(activity) => activity,
            None => return Ok(GateDecision::allow()),
        };

        if !activity.is_active() {
            return Ok(GateDecision::allow());
        }

        // Final-day carve-out: prior instance finished cleanly and today is
        // the last chance to re-optimize before the period closes.
        let prior_completed = activity
            .latest_instance
            .as_ref()
            .map(|i| i.status == InstanceStatus::Completed)
            .unwrap_or(false);

        if period.is_final_day(today) && prior_completed {
            warn!(
                tenant_id,
                running_session_id = activity.session.id,
                "final-day re-optimization allowed alongside active session"
            );
            return Ok(GateDecision {
                allow: true,
                running_session_id: Some(activity.session.id),
            });
        }

        info!(
            tenant_id,
            running_session_id = activity.session.id,
            open_queues = activity.open_queues,
            "session blocked by active run"
        );
        Ok(GateDecision {
            allow: false,
            running_session_id: Some(activity.session.id),
        })
    }
}
