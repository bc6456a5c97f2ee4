//! In-process `ProcessStore` for embedding and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{InstanceQuery, InstanceRecord, ProcessStore};
use crate::types::{ExecutionResult, ProcessInstance, ProcessLogEntry, ProcessTemplate};

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, ProcessInstance>,
    /// Concrete-type columns keyed by instance id.
    typed: HashMap<Uuid, (String, serde_json::Value)>,
    templates: HashMap<Uuid, ProcessTemplate>,
    history: Vec<ProcessLogEntry>,
}

/// Memory-backed store.
///
/// Keeps the retry counter the way a database trigger would: a status write
/// that moves an instance into `Faulted` from any other status increments
/// `bad_execution_count`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance together with the columns of its concrete type.
    pub fn insert_typed_instance(
        &self,
        instance: &ProcessInstance,
        fields: serde_json::Value,
    ) -> Result<()> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        tables
            .typed
            .insert(instance.id, (instance.additional_type.clone(), fields));
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.inner.read().map(|t| t.instances.len()).unwrap_or(0)
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProcessInstance),
    {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let row = tables
            .instances
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Process instance not found: {}", id))?;
        let previous = row.status;
        apply(row);
        count_fault(previous, row);
        Ok(())
    }
}

fn count_fault(previous: ExecutionResult, row: &mut ProcessInstance) {
    if row.status == ExecutionResult::Faulted && previous != ExecutionResult::Faulted {
        row.bad_execution_count += 1;
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn query_instances(&self, query: &InstanceQuery) -> Result<Vec<Uuid>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut due: Vec<&ProcessInstance> = tables
            .instances
            .values()
            .filter(|instance| query.matches(instance))
            .collect();
        due.sort_by(|a, b| {
            a.execution_date
                .cmp(&b.execution_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(due.into_iter().take(query.limit).map(|i| i.id).collect())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(tables.instances.get(&id).cloned())
    }

    async fn load_instance_as(
        &self,
        additional_type: &str,
        id: Uuid,
    ) -> Result<Option<InstanceRecord>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(instance) = tables.instances.get(&id) else {
            return Ok(None);
        };
        let record = match tables.typed.get(&id) {
            Some((kind, fields)) if kind == additional_type => InstanceRecord {
                instance: instance.clone(),
                fields: fields.clone(),
            },
            _ => return Ok(None),
        };
        Ok(Some(record))
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut row = instance.clone();
        if let Some(existing) = tables.instances.get(&instance.id) {
            if row.status == ExecutionResult::Faulted && existing.status != ExecutionResult::Faulted
            {
                row.bad_execution_count = existing.bad_execution_count;
            }
            count_fault(existing.status, &mut row);
        }
        tables.instances.insert(row.id, row);
        Ok(())
    }

    async fn update_instance_status(&self, id: Uuid, status: ExecutionResult) -> Result<()> {
        self.update(id, |row| row.status = status)
    }

    async fn update_instance_schedule(
        &self,
        id: Uuid,
        status: ExecutionResult,
        execution_date: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |row| {
            row.status = status;
            row.execution_date = Some(execution_date);
        })
    }

    async fn update_instance_metadata(&self, id: Uuid, metadata: &str) -> Result<()> {
        self.update(id, |row| row.metadata = Some(metadata.to_string()))
    }

    async fn load_template(&self, id: Uuid) -> Result<Option<ProcessTemplate>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(tables.templates.get(&id).cloned())
    }

    async fn save_template(&self, template: &ProcessTemplate) -> Result<()> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        tables.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn append_history(&self, entry: &ProcessLogEntry) -> Result<()> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        tables.history.push(entry.clone());
        Ok(())
    }

    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<ProcessLogEntry>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(tables
            .history
            .iter()
            .filter(|entry| entry.process_instance == instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn due(store: &MemoryStore, template: Uuid, seconds_ago: i64) -> Uuid {
        let instance = ProcessInstance::new(template)
            .with_execution_date(Utc::now() - Duration::seconds(seconds_ago));
        let id = instance.id;
        store.insert_typed_instance(&instance, json!({})).unwrap();
        id
    }

    #[tokio::test]
    async fn query_orders_by_execution_date_and_limits() {
        let store = MemoryStore::new();
        let template = Uuid::new_v4();
        let t3 = due(&store, template, 10);
        let t1 = due(&store, template, 30);
        let t2 = due(&store, template, 20);
        assert_eq!(store.instance_count(), 3);

        let ids = store
            .query_instances(&InstanceQuery::runnable(4, 2, Utc::now()))
            .await
            .unwrap();
        assert_eq!(ids, vec![t1, t2]);

        let all = store
            .query_instances(&InstanceQuery::runnable(4, 10, Utc::now()))
            .await
            .unwrap();
        assert_eq!(all, vec![t1, t2, t3]);
    }

    #[tokio::test]
    async fn faulting_increments_bad_execution_count_once_per_transition() {
        let store = MemoryStore::new();
        let instance = ProcessInstance::new(Uuid::new_v4());
        let id = instance.id;
        store.save_instance(&instance).await.unwrap();

        store.update_instance_status(id, ExecutionResult::Started).await.unwrap();
        store.update_instance_status(id, ExecutionResult::Faulted).await.unwrap();
        store.update_instance_status(id, ExecutionResult::Faulted).await.unwrap();
        assert_eq!(store.load_instance(id).await.unwrap().unwrap().bad_execution_count, 1);

        store.update_instance_status(id, ExecutionResult::Started).await.unwrap();
        let mut row = store.load_instance(id).await.unwrap().unwrap();
        row.status = ExecutionResult::Faulted;
        store.save_instance(&row).await.unwrap();
        assert_eq!(store.load_instance(id).await.unwrap().unwrap().bad_execution_count, 2);
    }

    #[tokio::test]
    async fn manual_save_can_reset_the_counter() {
        let store = MemoryStore::new();
        let mut instance = ProcessInstance::new(Uuid::new_v4());
        instance.status = ExecutionResult::Faulted;
        instance.bad_execution_count = 4;
        store.save_instance(&instance).await.unwrap();

        instance.status = ExecutionResult::None;
        instance.bad_execution_count = 0;
        store.save_instance(&instance).await.unwrap();
        assert_eq!(
            store.load_instance(instance.id).await.unwrap().unwrap().bad_execution_count,
            0
        );
    }

    #[tokio::test]
    async fn typed_rows_require_matching_type() {
        let store = MemoryStore::new();
        let instance = ProcessInstance::new(Uuid::new_v4()).with_additional_type("OrderProcess");
        store
            .insert_typed_instance(&instance, json!({ "order": "SO-1" }))
            .unwrap();

        let record = store
            .load_instance_as("OrderProcess", instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fields["order"], "SO-1");
        assert!(store
            .load_instance_as("InvoiceProcess", instance.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_update_on_missing_instance_fails() {
        let store = MemoryStore::new();
        assert!(store
            .update_instance_status(Uuid::new_v4(), ExecutionResult::Started)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn history_is_filtered_per_instance() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        for (id, message) in [(a, "first"), (Uuid::new_v4(), "other"), (a, "second")] {
            store
                .append_history(&ProcessLogEntry {
                    process_instance: id,
                    workflow_status: ExecutionResult::Started,
                    message: message.to_string(),
                    data: json!(null),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let history = store.load_history(a).await.unwrap();
        let messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
