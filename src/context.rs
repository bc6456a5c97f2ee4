//! What a running activity can see and ask for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::client::ProcessInstanceClient;
use crate::types::InstanceMetadata;

/// Requests an activity may raise for the process it runs in. They are read
/// by the step hooks once the activity has closed.
#[derive(Debug, Default)]
pub struct StepControl {
    reload: AtomicBool,
    pause: AtomicBool,
}

impl StepControl {
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Reload is sticky for the whole run: it is consulted at the end event.
    pub fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    /// Pause applies to the step that asked for it only.
    pub fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::SeqCst)
    }
}

/// Execution context handed to `Activity::execute` and `Activity::invoke`.
#[derive(Clone, Default)]
pub struct ActivityContext {
    instance_id: Option<Uuid>,
    data: Option<serde_json::Value>,
    client: Option<ProcessInstanceClient>,
    metadata: Arc<Mutex<InstanceMetadata>>,
    control: Arc<StepControl>,
}

impl ActivityContext {
    /// A context bound to no process instance, for standalone activity trees.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn for_instance(
        client: ProcessInstanceClient,
        metadata: InstanceMetadata,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            instance_id: Some(client.instance_id()),
            data,
            client: Some(client),
            metadata: Arc::new(Mutex::new(metadata)),
            control: Arc::new(StepControl::default()),
        }
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance_id
    }

    /// Payload produced by target resolution, if any.
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    pub fn client(&self) -> Option<&ProcessInstanceClient> {
        self.client.as_ref()
    }

    pub fn control(&self) -> &StepControl {
        &self.control
    }

    pub fn request_reload(&self) {
        self.control.request_reload();
    }

    pub fn request_pause(&self) {
        self.control.request_pause();
    }

    /// Read a keyed value from the instance metadata.
    pub fn meta(&self, name: &str) -> Option<serde_json::Value> {
        self.metadata
            .lock()
            .ok()
            .and_then(|meta| meta.get(name).cloned())
    }

    /// Write a keyed value into the instance metadata. It is persisted with
    /// the next instance save.
    pub fn set_meta(&self, name: impl Into<String>, value: serde_json::Value) {
        match self.metadata.lock() {
            Ok(mut meta) => meta.set(name, value),
            Err(e) => tracing::error!(error = %e, "Instance metadata lock poisoned"),
        }
    }

    pub fn metadata_snapshot(&self) -> InstanceMetadata {
        self.metadata
            .lock()
            .map(|meta| meta.clone())
            .unwrap_or_default()
    }

    pub(crate) fn update_metadata(&self, update: impl FnOnce(&mut InstanceMetadata)) {
        match self.metadata.lock() {
            Ok(mut meta) => update(&mut meta),
            Err(e) => tracing::error!(error = %e, "Instance metadata lock poisoned"),
        }
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("instance_id", &self.instance_id)
            .field("data", &self.data)
            .field("control", &self.control)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pause_is_consumed_but_reload_sticks() {
        let ctx = ActivityContext::detached();
        ctx.request_pause();
        ctx.request_reload();
        assert!(ctx.control().take_pause());
        assert!(!ctx.control().take_pause());
        assert!(ctx.control().reload_requested());
        assert!(ctx.control().reload_requested());
    }

    #[test]
    fn metadata_values_are_shared_between_clones() {
        let ctx = ActivityContext::detached();
        let other = ctx.clone();
        other.set_meta("approvals", json!(3));
        assert_eq!(ctx.meta("approvals"), Some(json!(3)));
        assert_eq!(ctx.meta("missing"), None);
    }
}
