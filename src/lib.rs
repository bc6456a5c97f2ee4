//! Embedded BPMN process engine.
//!
//! A timer-driven scheduler polls a [`ProcessStore`] for due process
//! instances, loads each instance's BPMN definition and walks it as a chain
//! of [`Activity`] state machines, persisting status as it goes.
//!
//! ```text
//! ProcessEngine::tick ─► InstanceQuery ─► load pipeline ─► FlowProcess::run
//!        │                                    │                  │
//!   SessionFactory                     DefinitionLoader     StepHooks + Activity
//! ```
//!
//! Everything is async (tokio). Collaborators sit behind traits so hosts can
//! plug their own persistence and definition sources; `MemoryStore` and the
//! file/memory definition loaders cover embedding and tests.

pub mod activity;
pub mod client;
pub mod composite;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod logging;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod store;
pub mod store_memory;
pub mod types;

pub use activity::{
    Activity, ActivityCore, ActivityEvent, ActivityListener, ActivityStateChangedEventArgs,
    FlowNodeActivity, FnListener,
};
pub use client::ProcessInstanceClient;
pub use composite::{CompositeActivity, CompositeKind};
pub use config::{EngineConfig, LoggingConfig};
pub use context::ActivityContext;
pub use definition::{
    DefinitionError, DefinitionLoader, FileDefinitionLoader, FlowObject, FlowObjectKind,
    MemoryDefinitionLoader, ProcessDefinition, SequenceFlow,
};
pub use engine::{EngineBuilder, ProcessEngine, TickReport};
pub use error::{ActivityError, EngineError};
pub use process::{FlowProcess, StepAction, StepHooks, StepOutcome};
pub use registry::{ActivityFactory, ActivityRegistry, InstanceBinding, InstanceTypeRegistry, TargetResolver};
pub use runtime::BusinessProcessRuntime;
pub use session::{ServiceIdentity, Session, SessionFactory, StoreSessionFactory};
pub use store::{InstanceQuery, InstanceRecord, ProcessStore};
pub use store_memory::MemoryStore;
pub use types::{
    ExecutionResult, ExecutionState, InstanceMetadata, InstanceRef, ProcessInstance,
    ProcessLogEntry, ProcessTemplate,
};
