use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{ExecutionResult, ProcessInstance, ProcessLogEntry, ProcessTemplate};

/// Instance statuses the scheduler picks up.
pub const RUNNABLE_STATUSES: [ExecutionResult; 3] = [
    ExecutionResult::None,
    ExecutionResult::Faulted,
    ExecutionResult::Paused,
];

/// Scheduler selection predicate: status set, retry ceiling, due date,
/// ascending execution date, row limit. Results are projected to ids.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceQuery {
    pub statuses: Vec<ExecutionResult>,
    /// Exclusive upper bound on `bad_execution_count`.
    pub bad_execution_ceiling: u32,
    /// Inclusive upper bound on `execution_date`.
    pub due_before: DateTime<Utc>,
    pub limit: usize,
}

impl InstanceQuery {
    pub fn runnable(bad_execution_ceiling: u32, limit: usize, now: DateTime<Utc>) -> Self {
        Self {
            statuses: RUNNABLE_STATUSES.to_vec(),
            bad_execution_ceiling,
            due_before: now,
            limit,
        }
    }

    /// Row predicate. Instances without an execution date are never due.
    pub fn matches(&self, instance: &ProcessInstance) -> bool {
        self.statuses.contains(&instance.status)
            && instance.bad_execution_count < self.bad_execution_ceiling
            && instance
                .execution_date
                .is_some_and(|date| date <= self.due_before)
    }
}

/// An instance row fetched as its concrete `additional_type`. `fields`
/// carries the columns the concrete type adds to the base instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance: ProcessInstance,
    pub fields: serde_json::Value,
}

impl InstanceRecord {
    pub fn base(instance: ProcessInstance) -> Self {
        Self {
            instance,
            fields: serde_json::Value::Null,
        }
    }
}

/// Persistence trait for process instances, templates and history.
///
/// The engine operates exclusively through this trait. Every status write
/// that moves an instance into `Faulted` from another status must increment
/// its `bad_execution_count`.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Instance ──

    async fn query_instances(&self, query: &InstanceQuery) -> Result<Vec<Uuid>>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn load_instance_as(
        &self,
        additional_type: &str,
        id: Uuid,
    ) -> Result<Option<InstanceRecord>>;
    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;
    async fn update_instance_status(&self, id: Uuid, status: ExecutionResult) -> Result<()>;
    async fn update_instance_schedule(
        &self,
        id: Uuid,
        status: ExecutionResult,
        execution_date: DateTime<Utc>,
    ) -> Result<()>;
    async fn update_instance_metadata(&self, id: Uuid, metadata: &str) -> Result<()>;

    // ── Templates ──

    async fn load_template(&self, id: Uuid) -> Result<Option<ProcessTemplate>>;
    async fn save_template(&self, template: &ProcessTemplate) -> Result<()>;

    // ── History (append-only) ──

    async fn append_history(&self, entry: &ProcessLogEntry) -> Result<()>;
    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<ProcessLogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instance(status: ExecutionResult, bad: u32, due: Option<DateTime<Utc>>) -> ProcessInstance {
        let mut instance = ProcessInstance::new(Uuid::new_v4());
        instance.status = status;
        instance.bad_execution_count = bad;
        instance.execution_date = due;
        instance
    }

    #[test]
    fn runnable_predicate() {
        let now = Utc::now();
        let query = InstanceQuery::runnable(4, 10, now);
        let past = Some(now - Duration::seconds(1));

        assert!(query.matches(&instance(ExecutionResult::None, 0, past)));
        assert!(query.matches(&instance(ExecutionResult::Faulted, 3, past)));
        assert!(query.matches(&instance(ExecutionResult::Paused, 0, Some(now))));

        assert!(!query.matches(&instance(ExecutionResult::Faulted, 4, past)));
        assert!(!query.matches(&instance(ExecutionResult::Started, 0, past)));
        assert!(!query.matches(&instance(ExecutionResult::Succeeded, 0, past)));
        assert!(!query.matches(&instance(ExecutionResult::Canceled, 0, past)));
        assert!(!query.matches(&instance(
            ExecutionResult::None,
            0,
            Some(now + Duration::seconds(1))
        )));
        assert!(!query.matches(&instance(ExecutionResult::None, 0, None)));
    }
}
