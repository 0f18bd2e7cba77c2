//! Engine store
//!
//! All cross-worker coordination happens through this surface: queue status
//! rows with conditional (compare-and-set) transitions, the group read
//! surface populated by the external device sync, assignment rows, and the
//! derived "what is this tenant running" projection the session gate reads.
//!
//! There is no "is anything running" global; activity is computed on demand
//! from the session/instance/queue rows.
//!
//! `MemoryStore` backs tests and the in-process CLI pipeline; a relational
//! implementation fills the same trait.

use crate::assigner::StrategyKind;
use crate::error::{EngineError, Result};
use crate::types::{
    Assignment, Device, DeviceGroup, InstanceStatus, OptimizationInstance, PlanSequence,
    QueueItem, QueueStatus, RatePlan, Session, SessionStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Read-only inputs for one group, populated by the external sync process
#[derive(Debug, Clone, Default)]
pub struct GroupData {
    pub devices: Vec<Device>,
    pub plans: Vec<RatePlan>,
}

/// Derived activity projection for a tenant's most recent session
#[derive(Debug, Clone)]
pub struct TenantActivity {
    pub session: Session,
    pub latest_instance: Option<OptimizationInstance>,
    /// Queues not yet in a terminal status across the session's instances
    pub open_queues: usize,
}

impl TenantActivity {
    /// Whether the session still counts as running for gating purposes
    pub fn is_active(&self) -> bool {
        !self.session.status.is_error_terminal()
            && (self.open_queues > 0 || self.session.status != SessionStatus::Completed)
    }
}

/// Coordination and persistence surface for the engine
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Reserve `count` contiguous ids; returns the first
    async fn reserve_ids(&self, count: u64) -> Result<u64>;

    async fn insert_session(&self, session: Session) -> Result<()>;
    async fn session(&self, session_id: u64) -> Result<Session>;
    async fn set_session_status(&self, session_id: u64, status: SessionStatus) -> Result<()>;
    /// Most recent session for a tenant, by creation time
    async fn latest_session_for_tenant(&self, tenant_id: u64) -> Result<Option<Session>>;
    /// Derived activity projection for the tenant's most recent session
    async fn tenant_activity(&self, tenant_id: u64) -> Result<Option<TenantActivity>>;

    async fn insert_instance(&self, instance: OptimizationInstance) -> Result<()>;
    async fn instance(&self, instance_id: u64) -> Result<OptimizationInstance>;
    async fn set_instance_status(&self, instance_id: u64, status: InstanceStatus) -> Result<()>;
    /// Conditional finalization: `Processing → to` only if still Processing.
    /// Returns false when another invocation finalized first.
    async fn try_finalize_instance(&self, instance_id: u64, to: InstanceStatus) -> Result<bool>;

    async fn insert_group(&self, group: DeviceGroup) -> Result<()>;
    async fn group(&self, group_id: u64) -> Result<DeviceGroup>;
    async fn groups_for_instance(&self, instance_id: u64) -> Result<Vec<DeviceGroup>>;
    /// Device snapshot and eligible plan set for a group
    async fn group_data(&self, group_id: u64) -> Result<GroupData>;
    /// Copy a group's read surface to another group. Follow-up instances
    /// evaluate the same devices and plans as the group they continue.
    async fn clone_group_data(&self, from_group_id: u64, to_group_id: u64) -> Result<()>;

    async fn insert_sequences(&self, sequences: Vec<PlanSequence>) -> Result<()>;
    async fn sequence(&self, sequence_id: u64) -> Result<PlanSequence>;

    async fn insert_queues(&self, queues: Vec<QueueItem>) -> Result<()>;
    async fn queue(&self, queue_id: u64) -> Result<QueueItem>;
    async fn queues_for_group(&self, group_id: u64) -> Result<Vec<QueueItem>>;
    async fn queues_for_instance(&self, instance_id: u64) -> Result<Vec<QueueItem>>;
    /// Compare-and-set status transition. Returns false (no mutation) when
    /// the row is no longer in `from` — the redelivery-race guard.
    async fn try_transition_queue(
        &self,
        queue_id: u64,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<bool>;
    /// Record the assigner's best result and mark the queue Complete
    async fn record_queue_result(
        &self,
        queue_id: u64,
        total_cost: f64,
        strategy: StrategyKind,
    ) -> Result<()>;
    /// Mark the queue Error (validation failures, exhausted retries)
    async fn mark_queue_error(&self, queue_id: u64) -> Result<()>;

    async fn save_assignments(&self, queue_id: u64, assignments: Vec<Assignment>) -> Result<()>;
    async fn assignments_for_queue(&self, queue_id: u64) -> Result<Vec<Assignment>>;
    async fn delete_assignments(&self, queue_id: u64) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sessions: HashMap<u64, Session>,
    instances: HashMap<u64, OptimizationInstance>,
    groups: HashMap<u64, DeviceGroup>,
    group_data: HashMap<u64, GroupData>,
    sequences: HashMap<u64, PlanSequence>,
    queues: HashMap<u64, QueueItem>,
    assignments: HashMap<u64, Vec<Assignment>>,
}

/// In-memory store for tests and single-process runs
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Populate a group's read surface (stands in for the external sync)
    pub fn put_group_data(&self, group_id: u64, devices: Vec<Device>, plans: Vec<RatePlan>) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.group_data.insert(group_id, GroupData { devices, plans });
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::store("store lock poisoned"))
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn reserve_ids(&self, count: u64) -> Result<u64> {
        let mut inner = self.lock()?;
        let first = inner.next_id;
        inner.next_id += count;
        Ok(first)
    }

    async fn insert_session(&self, session: Session) -> Result<()> {
        self.lock()?.sessions.insert(session.id, session);
        Ok(())
    }

    async fn session(&self, session_id: u64) -> Result<Session> {
        self.lock()?
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("session", session_id))
    }

    async fn set_session_status(&self, session_id: u64, status: SessionStatus) -> Result<()> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| EngineError::not_found("session", session_id))?;
        session.status = status;
        Ok(())
    }

    async fn latest_session_for_tenant(&self, tenant_id: u64) -> Result<Option<Session>> {
        let inner = self.lock()?;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .max_by_key(|s| (s.created_at, s.id))
            .cloned())
    }

    async fn tenant_activity(&self, tenant_id: u64) -> Result<Option<TenantActivity>> {
        let inner = self.lock()?;
        let session = match inner
            .sessions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .max_by_key(|s| (s.created_at, s.id))
        {
            Some(s) => s.clone(),
            None => return Ok(None),
        };

        let latest_instance = inner
            .instances
            .values()
            .filter(|i| i.session_id == session.id)
            .max_by_key(|i| i.id)
            .cloned();

        let instance_ids: Vec<u64> = inner
            .instances
            .values()
            .filter(|i| i.session_id == session.id)
            .map(|i| i.id)
            .collect();
        let group_ids: Vec<u64> = inner
            .groups
            .values()
            .filter(|g| instance_ids.contains(&g.instance_id))
            .map(|g| g.id)
            .collect();
        let open_queues = inner
            .queues
            .values()
            .filter(|q| group_ids.contains(&q.group_id) && !q.status.is_terminal())
            .count();

        Ok(Some(TenantActivity {
            session,
            latest_instance,
            open_queues,
        }))
    }

    async fn insert_instance(&self, instance: OptimizationInstance) -> Result<()> {
        self.lock()?.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn instance(&self, instance_id: u64) -> Result<OptimizationInstance> {
        self.lock()?
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("instance", instance_id))
    }

    async fn set_instance_status(&self, instance_id: u64, status: InstanceStatus) -> Result<()> {
        let mut inner = self.lock()?;
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| EngineError::not_found("instance", instance_id))?;
        instance.status = status;
        Ok(())
    }

    async fn try_finalize_instance(&self, instance_id: u64, to: InstanceStatus) -> Result<bool> {
        let mut inner = self.lock()?;
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| EngineError::not_found("instance", instance_id))?;
        if instance.status.is_terminal() {
            return Ok(false);
        }
        instance.status = to;
        Ok(true)
    }

    async fn insert_group(&self, group: DeviceGroup) -> Result<()> {
        self.lock()?.groups.insert(group.id, group);
        Ok(())
    }

    async fn group(&self, group_id: u64) -> Result<DeviceGroup> {
        self.lock()?
            .groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("group", group_id))
    }

    async fn groups_for_instance(&self, instance_id: u64) -> Result<Vec<DeviceGroup>> {
        let inner = self.lock()?;
        let mut groups: Vec<DeviceGroup> = inner
            .groups
            .values()
            .filter(|g| g.instance_id == instance_id)
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    async fn group_data(&self, group_id: u64) -> Result<GroupData> {
        self.lock()?
            .group_data
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("group data", group_id))
    }

    async fn clone_group_data(&self, from_group_id: u64, to_group_id: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let data = inner
            .group_data
            .get(&from_group_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("group data", from_group_id))?;
        inner.group_data.insert(to_group_id, data);
        Ok(())
    }

    async fn insert_sequences(&self, sequences: Vec<PlanSequence>) -> Result<()> {
        let mut inner = self.lock()?;
        for seq in sequences {
            inner.sequences.insert(seq.id, seq);
        }
        Ok(())
    }

    async fn sequence(&self, sequence_id: u64) -> Result<PlanSequence> {
        self.lock()?
            .sequences
            .get(&sequence_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("sequence", sequence_id))
    }

    async fn insert_queues(&self, queues: Vec<QueueItem>) -> Result<()> {
        let mut inner = self.lock()?;
        for queue in queues {
            inner.queues.insert(queue.id, queue);
        }
        Ok(())
    }

    async fn queue(&self, queue_id: u64) -> Result<QueueItem> {
        self.lock()?
            .queues
            .get(&queue_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("queue", queue_id))
    }

    async fn queues_for_group(&self, group_id: u64) -> Result<Vec<QueueItem>> {
        let inner = self.lock()?;
        let mut queues: Vec<QueueItem> = inner
            .queues
            .values()
            .filter(|q| q.group_id == group_id)
            .cloned()
            .collect();
        queues.sort_by_key(|q| q.id);
        Ok(queues)
    }

    async fn queues_for_instance(&self, instance_id: u64) -> Result<Vec<QueueItem>> {
        let inner = self.lock()?;
        let group_ids: Vec<u64> = inner
            .groups
            .values()
            .filter(|g| g.instance_id == instance_id)
            .map(|g| g.id)
            .collect();
        let mut queues: Vec<QueueItem> = inner
            .queues
            .values()
            .filter(|q| group_ids.contains(&q.group_id))
            .cloned()
            .collect();
        queues.sort_by_key(|q| q.id);
        Ok(queues)
    }

    async fn try_transition_queue(
        &self,
        queue_id: u64,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| EngineError::not_found("queue", queue_id))?;
        if queue.status != from {
            debug!(
                queue_id,
                current = ?queue.status,
                expected = ?from,
                "conditional transition lost the race"
            );
            return Ok(false);
        }
        queue.status = to;
        Ok(true)
    }

    async fn record_queue_result(
        &self,
        queue_id: u64,
        total_cost: f64,
        strategy: StrategyKind,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| EngineError::not_found("queue", queue_id))?;
        queue.total_cost = Some(total_cost);
        queue.strategy_used = Some(strategy);
        queue.status = QueueStatus::Complete;
        Ok(())
    }

    async fn mark_queue_error(&self, queue_id: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| EngineError::not_found("queue", queue_id))?;
        queue.status = QueueStatus::Error;
        Ok(())
    }

    async fn save_assignments(&self, queue_id: u64, assignments: Vec<Assignment>) -> Result<()> {
        self.lock()?.assignments.insert(queue_id, assignments);
        Ok(())
    }

    async fn assignments_for_queue(&self, queue_id: u64) -> Result<Vec<Assignment>> {
        Ok(self
            .lock()?
            .assignments
            .get(&queue_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_assignments(&self, queue_id: u64) -> Result<()> {
        self.lock()?.assignments.remove(&queue_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BillingPeriod;
    use chrono::NaiveDate;

    fn period() -> BillingPeriod {
        BillingPeriod::new(
            1,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_conditional_queue_transition() {
        let store = MemoryStore::new();
        store
            .insert_queues(vec![QueueItem::new(1, 10, 100)])
            .await
            .unwrap();

        // First claim wins
        assert!(store
            .try_transition_queue(1, QueueStatus::Pending, QueueStatus::Processing)
            .await
            .unwrap());
        // Redelivered duplicate loses and mutates nothing
        assert!(!store
            .try_transition_queue(1, QueueStatus::Pending, QueueStatus::Processing)
            .await
            .unwrap());
        assert_eq!(
            store.queue(1).await.unwrap().status,
            QueueStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_clone_group_data_copies_read_surface() {
        let store = MemoryStore::new();
        store.put_group_data(
            10,
            vec![Device::new(1, 500.0, 1)],
            vec![RatePlan::new(1, 1, 10.0, 1000.0).with_overage(0.02, 1.0)],
        );

        store.clone_group_data(10, 20).await.unwrap();

        let copied = store.group_data(20).await.unwrap();
        assert_eq!(copied.devices.len(), 1);
        assert_eq!(copied.plans.len(), 1);
        // Missing source is a lookup error
        assert!(store.clone_group_data(99, 30).await.is_err());
    }

    #[tokio::test]
    async fn test_finalize_instance_only_once() {
        let store = MemoryStore::new();
        let mut instance = OptimizationInstance::new(1, 1, crate::types::PortalType::M2m);
        instance.status = InstanceStatus::Processing;
        store.insert_instance(instance).await.unwrap();

        assert!(store
            .try_finalize_instance(1, InstanceStatus::Completed)
            .await
            .unwrap());
        assert!(!store
            .try_finalize_instance(1, InstanceStatus::Completed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_tenant_activity_projection() {
        let store = MemoryStore::new();
        let session = Session::new(1, 42, period());
        store.insert_session(session).await.unwrap();

        let mut instance = OptimizationInstance::new(2, 1, crate::types::PortalType::M2m);
        instance.status = InstanceStatus::Processing;
        store.insert_instance(instance).await.unwrap();
        store
            .insert_group(DeviceGroup {
                id: 3,
                instance_id: 2,
                kind: crate::types::GroupKind::OptimizationGroup,
            })
            .await
            .unwrap();
        store
            .insert_queues(vec![QueueItem::new(4, 3, 100)])
            .await
            .unwrap();

        let activity = store.tenant_activity(42).await.unwrap().unwrap();
        assert_eq!(activity.open_queues, 1);
        assert!(activity.is_active());

        store.record_queue_result(4, 10.0, crate::assigner::STRATEGY_MATRIX[0]).await.unwrap();
        store
            .set_session_status(1, SessionStatus::Completed)
            .await
            .unwrap();
        let activity = store.tenant_activity(42).await.unwrap().unwrap();
        assert_eq!(activity.open_queues, 0);
        assert!(!activity.is_active());
    }

    #[tokio::test]
    async fn test_reserve_ids_contiguous() {
        let store = MemoryStore::new();
        let a = store.reserve_ids(5).await.unwrap();
        let b = store.reserve_ids(1).await.unwrap();
        assert_eq!(b, a + 5);
    }

    #[tokio::test]
    async fn test_assignment_rows_lifecycle() {
        let store = MemoryStore::new();
        let rows = vec![Assignment {
            queue_id: 1,
            device_id: 2,
            rate_pool_index: 0,
            computed_cost: 9.0,
        }];
        store.save_assignments(1, rows.clone()).await.unwrap();
        assert_eq!(store.assignments_for_queue(1).await.unwrap(), rows);

        store.delete_assignments(1).await.unwrap();
        assert!(store.assignments_for_queue(1).await.unwrap().is_empty());
    }
}
