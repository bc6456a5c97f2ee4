//! Unattended execution sessions.
//!
//! The scheduler works outside of any end-user request. Each tick opens a
//! session bound to a service identity and finalizes it on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::store::ProcessStore;

pub const DEFAULT_SERVICE_ACCOUNT: &str = "service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub authentication_type: String,
}

impl ServiceIdentity {
    pub fn basic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authentication_type: "Basic".to_string(),
        }
    }
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> Uuid;
    fn identity(&self) -> &ServiceIdentity;
    fn store(&self) -> Arc<dyn ProcessStore>;
    /// Release the session. Called exactly once by whoever opened it.
    async fn finalize(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_unattended(&self) -> Result<Arc<dyn Session>>;
}

/// Sessions over one shared store.
pub struct StoreSessionFactory {
    store: Arc<dyn ProcessStore>,
    identity: ServiceIdentity,
}

impl StoreSessionFactory {
    pub fn new(store: Arc<dyn ProcessStore>, unattended_account: Option<&str>) -> Self {
        let account = unattended_account
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
        Self {
            store,
            identity: ServiceIdentity::basic(account),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn open(&self) -> StoreSession {
        let session = StoreSession {
            id: Uuid::now_v7(),
            identity: self.identity.clone(),
            store: self.store.clone(),
            finalized: AtomicBool::new(false),
        };
        tracing::debug!(session_id = %session.id, account = %session.identity.name, "Unattended session opened");
        session
    }
}

#[async_trait]
impl SessionFactory for StoreSessionFactory {
    async fn open_unattended(&self) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(self.open()))
    }
}

pub struct StoreSession {
    id: Uuid,
    identity: ServiceIdentity,
    store: Arc<dyn ProcessStore>,
    finalized: AtomicBool,
}

impl StoreSession {
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for StoreSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    fn store(&self) -> Arc<dyn ProcessStore> {
        self.store.clone()
    }

    async fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            tracing::warn!(session_id = %self.id, "Session finalized twice");
        } else {
            tracing::debug!(session_id = %self.id, "Unattended session finalized");
        }
        Ok(())
    }
}
