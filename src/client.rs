//! Instance-scoped façade handed to running activities.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::ProcessStore;
use crate::types::{ExecutionResult, InstanceMetadata, ProcessInstance, ProcessLogEntry};

/// Reads and writes one process instance through the store.
///
/// The status is cached so history records can be stamped without a
/// round trip. The cache is only updated after the store accepted a write.
#[derive(Clone)]
pub struct ProcessInstanceClient {
    store: Arc<dyn ProcessStore>,
    instance_id: Uuid,
    status: Arc<Mutex<ExecutionResult>>,
}

impl ProcessInstanceClient {
    pub fn new(store: Arc<dyn ProcessStore>, instance: &ProcessInstance) -> Self {
        Self {
            store,
            instance_id: instance.id,
            status: Arc::new(Mutex::new(instance.status)),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn status(&self) -> ExecutionResult {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(ExecutionResult::None)
    }

    fn cache(&self, status: ExecutionResult) -> Result<()> {
        let mut cached = self.status.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        *cached = status;
        Ok(())
    }

    pub async fn set_status(&self, status: ExecutionResult) -> Result<()> {
        self.store
            .update_instance_status(self.instance_id, status)
            .await?;
        tracing::debug!(instance_id = %self.instance_id, status = %status, "Instance status saved");
        self.cache(status)
    }

    /// Persist a status together with the next time the scheduler may pick
    /// the instance up.
    pub async fn reschedule(&self, status: ExecutionResult, at: DateTime<Utc>) -> Result<()> {
        self.store
            .update_instance_schedule(self.instance_id, status, at)
            .await?;
        tracing::debug!(
            instance_id = %self.instance_id,
            status = %status,
            execution_date = %at,
            "Instance rescheduled"
        );
        self.cache(status)
    }

    pub async fn save_metadata(&self, metadata: &InstanceMetadata) -> Result<()> {
        let raw = serde_json::to_string(metadata)?;
        self.store
            .update_instance_metadata(self.instance_id, &raw)
            .await
    }

    /// Append a history record stamped with this instance and its current
    /// status.
    pub async fn write_history(
        &self,
        message: impl Into<String> + Send,
        data: serde_json::Value,
    ) -> Result<()> {
        let entry = ProcessLogEntry {
            process_instance: self.instance_id,
            workflow_status: self.status(),
            message: message.into(),
            data,
            created_at: Utc::now(),
        };
        self.store.append_history(&entry).await
    }

    pub async fn history(&self) -> Result<Vec<ProcessLogEntry>> {
        self.store.load_history(self.instance_id).await
    }

    pub async fn reload(&self) -> Result<Option<ProcessInstance>> {
        self.store.load_instance(self.instance_id).await
    }
}

impl std::fmt::Debug for ProcessInstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInstanceClient")
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    async fn client() -> (Arc<MemoryStore>, ProcessInstanceClient) {
        let store = Arc::new(MemoryStore::new());
        let instance = ProcessInstance::new(Uuid::new_v4());
        store.save_instance(&instance).await.unwrap();
        let client = ProcessInstanceClient::new(store.clone(), &instance);
        (store, client)
    }

    #[tokio::test]
    async fn set_status_persists_then_caches() {
        let (store, client) = client().await;
        client.set_status(ExecutionResult::Started).await.unwrap();

        assert_eq!(client.status(), ExecutionResult::Started);
        let row = store.load_instance(client.instance_id()).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionResult::Started);
    }

    #[tokio::test]
    async fn failed_write_keeps_cached_status() {
        let store = Arc::new(MemoryStore::new());
        let orphan = ProcessInstance::new(Uuid::new_v4());
        let client = ProcessInstanceClient::new(store, &orphan);

        assert!(client.set_status(ExecutionResult::Started).await.is_err());
        assert_eq!(client.status(), ExecutionResult::None);
    }

    #[tokio::test]
    async fn history_is_stamped_with_current_status() {
        let (_store, client) = client().await;
        client.set_status(ExecutionResult::Started).await.unwrap();
        client
            .write_history("stock reserved", json!({ "sku": "A-1" }))
            .await
            .unwrap();

        let history = client.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].workflow_status, ExecutionResult::Started);
        assert_eq!(history[0].process_instance, client.instance_id());
        assert_eq!(history[0].data["sku"], "A-1");
    }

    #[tokio::test]
    async fn metadata_round_trips_through_the_row() {
        let (_store, client) = client().await;
        let mut meta = InstanceMetadata::default();
        meta.state.last_flow_object = Some("Task_1".to_string());
        client.save_metadata(&meta).await.unwrap();

        let row = client.reload().await.unwrap().unwrap();
        assert_eq!(row.read_metadata(), meta);
    }
}
