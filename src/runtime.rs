use async_trait::async_trait;

use crate::error::EngineError;
use crate::session::Session;
use crate::types::InstanceRef;

/// Lifecycle a host drives an embedded process runtime through.
#[async_trait]
pub trait BusinessProcessRuntime: Send + Sync {
    /// Arm the scheduler. Idempotent.
    fn start(&self);

    /// Disarm the scheduler. Idempotent.
    fn stop(&self);

    fn is_started(&self) -> bool;

    /// Load one instance and run it to its next stopping point. An absent
    /// or deleted instance is a successful no-op.
    async fn load(
        &self,
        session: &dyn Session,
        instance: Option<InstanceRef>,
    ) -> Result<(), EngineError>;

    /// Withdraw an instance from scheduling by marking it `Canceled`.
    async fn unload(&self, session: &dyn Session, instance: InstanceRef)
        -> Result<(), EngineError>;
}
