//! ProcessEngine: timer-driven scheduler and the instance load pipeline.
//!
//! Each tick opens an unattended session, selects due instances (status
//! `None`/`Faulted`/`Paused`, below the bad-execution ceiling, oldest
//! execution date first, at most `max_processes`) and runs them one after
//! the other. A tick that fires while the previous one is still working is
//! skipped.
//!
//! ## Single flight
//!
//! The `working` flag is claimed with a compare-exchange and released by a
//! drop guard, so no exit path (error, panic, dropped future) can leave it
//! set. The batch itself runs in a child task: a panicking activity is
//! reported as a failed tick and the session is still finalized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use crate::client::ProcessInstanceClient;
use crate::config::EngineConfig;
use crate::context::ActivityContext;
use crate::definition::{DefinitionLoader, FileDefinitionLoader, FlowObject, ProcessDefinition};
use crate::error::EngineError;
use crate::process::{FlowProcess, StepAction, StepHooks, StepOutcome};
use crate::registry::{ActivityFactory, ActivityRegistry, InstanceBinding, InstanceTypeRegistry};
use crate::runtime::BusinessProcessRuntime;
use crate::session::{Session, SessionFactory, StoreSessionFactory};
use crate::store::{InstanceQuery, InstanceRecord, ProcessStore};
use crate::types::{ExecutionResult, InstanceMetadata, InstanceRef, ProcessInstance, ProcessTemplate};

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// The previous tick was still working.
    Skipped,
    /// No session, a failed query, or a panicking batch.
    Failed,
    /// Nothing was due.
    Idle,
    Processed { selected: usize, failed: usize },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    config: EngineConfig,
    sessions: Arc<dyn SessionFactory>,
    loader: Option<Arc<dyn DefinitionLoader>>,
    activities: ActivityRegistry,
    instance_types: InstanceTypeRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, sessions: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            sessions,
            loader: None,
            activities: ActivityRegistry::new(),
            instance_types: InstanceTypeRegistry::new(),
        }
    }

    /// Sessions over `store`, authenticated as the configured unattended
    /// account.
    pub fn with_store(config: EngineConfig, store: Arc<dyn ProcessStore>) -> Self {
        let sessions = StoreSessionFactory::new(store, config.unattended_account.as_deref());
        Self::new(config, Arc::new(sessions))
    }

    /// Defaults to a `FileDefinitionLoader` rooted at `definitions_root`.
    pub fn loader(mut self, loader: Arc<dyn DefinitionLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn activities(mut self, registry: ActivityRegistry) -> Self {
        self.activities = registry;
        self
    }

    pub fn activity(mut self, type_key: impl Into<String>, factory: impl ActivityFactory + 'static) -> Self {
        self.activities.register(type_key, factory);
        self
    }

    pub fn instance_type(mut self, additional_type: impl Into<String>, binding: InstanceBinding) -> Self {
        self.instance_types.register(additional_type, binding);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let loader = self.loader.unwrap_or_else(|| {
            Arc::new(FileDefinitionLoader::new(self.config.definitions_root.clone()))
        });
        ProcessEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                sessions: self.sessions,
                loader,
                activities: self.activities,
                instance_types: self.instance_types,
                working: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

struct Timer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct EngineInner {
    config: EngineConfig,
    sessions: Arc<dyn SessionFactory>,
    loader: Arc<dyn DefinitionLoader>,
    activities: ActivityRegistry,
    instance_types: InstanceTypeRegistry,
    working: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

/// Clears `working` when the tick ends, however it ends.
struct WorkingGuard<'a>(&'a AtomicBool);

impl<'a> WorkingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Embedded process engine. Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct ProcessEngine {
    inner: Arc<EngineInner>,
}

impl ProcessEngine {
    pub fn builder(config: EngineConfig, sessions: Arc<dyn SessionFactory>) -> EngineBuilder {
        EngineBuilder::new(config, sessions)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_working(&self) -> bool {
        self.inner.working.load(Ordering::SeqCst)
    }

    pub async fn open_session(&self) -> anyhow::Result<Arc<dyn Session>> {
        self.inner.sessions.open_unattended().await
    }

    /// The tick handler. The timer calls it every `interval`; hosts and
    /// tests may call it directly.
    pub async fn tick(&self) -> TickReport {
        let Some(_working) = WorkingGuard::acquire(&self.inner.working) else {
            tracing::debug!("Previous engine tick is still working, skipping");
            return TickReport::Skipped;
        };

        let session = match self.inner.sessions.open_unattended().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Cannot open unattended session");
                return TickReport::Failed;
            }
        };

        let inner = self.inner.clone();
        let batch = tokio::spawn(inner.run_batch(session.clone()));
        let report = match batch.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Engine tick aborted");
                TickReport::Failed
            }
        };

        if let Err(e) = session.finalize().await {
            tracing::error!(error = %format!("{e:#}"), "Cannot finalize unattended session");
        }
        report
    }
}

#[async_trait]
impl BusinessProcessRuntime for ProcessEngine {
    fn start(&self) {
        let Ok(mut timer) = self.inner.timer.lock() else {
            tracing::error!("Engine timer lock poisoned");
            return;
        };
        if timer.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("ProcessEngine::start called outside of a tokio runtime");
            return;
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = self.inner.config.interval();
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = engine.upgrade() else { break };
                        let engine = ProcessEngine { inner };
                        tokio::spawn(async move {
                            engine.tick().await;
                        });
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Engine timer stopped");
        });

        *timer = Some(Timer { shutdown, task });
        tracing::info!(
            interval_ms = self.inner.config.interval_ms,
            max_processes = self.inner.config.max_processes,
            bad_execution_times = self.inner.config.bad_execution_times,
            "Process engine started"
        );
    }

    fn stop(&self) {
        let Ok(mut timer) = self.inner.timer.lock() else {
            tracing::error!("Engine timer lock poisoned");
            return;
        };
        if let Some(Timer { shutdown, task }) = timer.take() {
            if shutdown.send(true).is_err() {
                task.abort();
            }
            tracing::info!("Process engine stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.inner
            .timer
            .lock()
            .map(|timer| timer.is_some())
            .unwrap_or(false)
    }

    async fn load(
        &self,
        session: &dyn Session,
        instance: Option<InstanceRef>,
    ) -> Result<(), EngineError> {
        self.inner.load(session, instance).await
    }

    async fn unload(
        &self,
        session: &dyn Session,
        instance: InstanceRef,
    ) -> Result<(), EngineError> {
        let store = session.store();
        if store.load_instance(instance.id).await?.is_none() {
            return Ok(());
        }
        store
            .update_instance_status(instance.id, ExecutionResult::Canceled)
            .await?;
        tracing::info!(instance_id = %instance.id, "Process instance unloaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch and load pipeline
// ---------------------------------------------------------------------------

/// Error message with its source chain.
fn describe(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

async fn mark_faulted(store: &dyn ProcessStore, id: Uuid) {
    if let Err(e) = store.update_instance_status(id, ExecutionResult::Faulted).await {
        tracing::warn!(instance_id = %id, error = %format!("{e:#}"), "Cannot mark instance faulted");
    }
}

/// Where a run starts: the recorded resume node of a paused instance,
/// otherwise the start event.
fn resume_point(
    instance: &ProcessInstance,
    metadata: &InstanceMetadata,
    definition: &ProcessDefinition,
) -> Option<String> {
    if instance.status != ExecutionResult::Paused {
        return None;
    }
    metadata
        .state
        .last_flow_object
        .clone()
        .filter(|id| definition.flow_object(id).is_some())
}

impl EngineInner {
    async fn run_batch(self: Arc<Self>, session: Arc<dyn Session>) -> TickReport {
        let query = InstanceQuery::runnable(
            self.config.bad_execution_times,
            self.config.max_processes,
            Utc::now(),
        );
        let ids = match session.store().query_instances(&query).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Process instance query failed");
                return TickReport::Failed;
            }
        };

        if ids.is_empty() {
            tracing::debug!("No process instances are due");
            return TickReport::Idle;
        }

        tracing::debug!(count = ids.len(), "Running due process instances");
        let mut failed = 0;
        for &id in &ids {
            let inner = self.clone();
            let run_session = session.clone();
            let run = tokio::spawn(async move {
                inner
                    .load(run_session.as_ref(), Some(InstanceRef::from(id)))
                    .await
            });
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::error!(instance_id = %id, error = %describe(&e), "Process instance run failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(instance_id = %id, error = %e, "Process instance run aborted");
                    mark_faulted(session.store().as_ref(), id).await;
                }
            }
        }

        TickReport::Processed {
            selected: ids.len(),
            failed,
        }
    }

    async fn load(
        &self,
        session: &dyn Session,
        instance: Option<InstanceRef>,
    ) -> Result<(), EngineError> {
        let Some(instance) = instance else {
            return Ok(());
        };
        let span = tracing::info_span!("process_instance", instance_id = %instance.id);
        self.load_instance(session, instance.id).instrument(span).await
    }

    async fn prepare(&self, template: &ProcessTemplate) -> Result<(FlowProcess, String), EngineError> {
        let definition = self
            .loader
            .load(&template.url)
            .await
            .map_err(|source| EngineError::DefinitionLoad {
                template: template.name.clone(),
                source,
            })?;
        let start = definition
            .start_event()
            .ok_or_else(|| EngineError::StartEventNotFound {
                template: template.name.clone(),
            })?
            .bpmn_id
            .clone();
        let process = FlowProcess::build(Arc::new(definition), &self.activities)?;
        Ok((process, start))
    }

    async fn load_instance(&self, session: &dyn Session, id: Uuid) -> Result<(), EngineError> {
        let store = session.store();

        let Some(instance) = store.load_instance(id).await? else {
            tracing::debug!("Process instance no longer exists");
            return Ok(());
        };

        let template = store
            .load_template(instance.template_id)
            .await?
            .ok_or(EngineError::TemplateNotFound { instance_id: id })?;

        let record = if instance.is_base_type() {
            InstanceRecord::base(instance.clone())
        } else {
            store
                .load_instance_as(&instance.additional_type, id)
                .await?
                .ok_or_else(|| EngineError::InstanceObjectNotFound {
                    additional_type: instance.additional_type.clone(),
                    instance_id: id,
                })?
        };

        let client = ProcessInstanceClient::new(store.clone(), &instance);
        client.set_status(ExecutionResult::Started).await?;

        let (process, start) = match self.prepare(&template).await {
            Ok(prepared) => prepared,
            Err(e) => {
                mark_faulted(store.as_ref(), id).await;
                return Err(e);
            }
        };

        let metadata = instance.read_metadata();
        let from = match resume_point(&instance, &metadata, process.definition()) {
            Some(node) => {
                tracing::info!(node = %node, "Resuming paused process instance");
                node
            }
            None => start,
        };

        let resolver = self
            .instance_types
            .get(&instance.additional_type)
            .and_then(InstanceBinding::target_resolver);
        let data = match resolver {
            Some(resolver) => match resolver.resolve_target(&record).await {
                Ok(data) => Some(data),
                Err(e) => {
                    client.set_status(ExecutionResult::Faulted).await?;
                    return Err(EngineError::TargetResolution {
                        instance_id: id,
                        message: format!("{e:#}"),
                    });
                }
            },
            None => None,
        };

        let ctx = ActivityContext::for_instance(client.clone(), metadata, data);
        let hooks = EngineStepHooks {
            definition: process.definition().clone(),
            client: client.clone(),
            reload_delay: self.config.reload_delay(),
        };

        match process.run(&from, &ctx, &hooks).await {
            Ok(outcome) => {
                tracing::info!(
                    template = %template.name,
                    last_node = %outcome.last_node,
                    steps = outcome.steps,
                    status = %client.status(),
                    "Process instance run finished"
                );
                Ok(())
            }
            Err(e) => {
                if !matches!(e, EngineError::Store(_)) {
                    mark_faulted(store.as_ref(), id).await;
                }
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step hooks
// ---------------------------------------------------------------------------

/// Next execution date for a reload request: never earlier than
/// `now + delay`, a later stored date is kept.
pub fn reload_date(
    stored: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    delay: chrono::Duration,
) -> DateTime<Utc> {
    let earliest = now + delay;
    match stored {
        Some(at) if at > earliest => at,
        _ => earliest,
    }
}

/// Persistence and routing policy around each flow object.
struct EngineStepHooks {
    definition: Arc<ProcessDefinition>,
    client: ProcessInstanceClient,
    reload_delay: chrono::Duration,
}

impl EngineStepHooks {
    async fn save_metadata(&self, ctx: &ActivityContext) -> Result<(), EngineError> {
        self.client.save_metadata(&ctx.metadata_snapshot()).await?;
        Ok(())
    }

    async fn finish(&self, step: &StepOutcome<'_>, ctx: &ActivityContext) -> Result<(), EngineError> {
        self.save_metadata(ctx).await?;
        if step.failed() {
            self.client.set_status(ExecutionResult::Faulted).await?;
            tracing::warn!(node = %step.node.bpmn_id, "Process instance ended faulted");
        } else if ctx.control().reload_requested() {
            let stored = self
                .client
                .reload()
                .await?
                .and_then(|instance| instance.execution_date);
            let at = reload_date(stored, Utc::now(), self.reload_delay);
            self.client.reschedule(ExecutionResult::None, at).await?;
            tracing::info!(execution_date = %at, "Process instance scheduled to run again");
        } else {
            self.client.set_status(ExecutionResult::Succeeded).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StepHooks for EngineStepHooks {
    async fn on_begin(&self, node: &FlowObject, ctx: &ActivityContext) -> Result<(), EngineError> {
        ctx.update_metadata(|meta| meta.state.last_flow_object = Some(node.bpmn_id.clone()));
        self.save_metadata(ctx).await
    }

    async fn on_end(
        &self,
        step: &StepOutcome<'_>,
        ctx: &ActivityContext,
    ) -> Result<StepAction, EngineError> {
        if step.is_terminal {
            self.finish(step, ctx).await?;
            return Ok(StepAction::Stop);
        }

        if step.failed() {
            self.save_metadata(ctx).await?;
            self.client.set_status(ExecutionResult::Faulted).await?;
            let error = step.error.map(ToString::to_string).unwrap_or_default();
            if let Some(boundary) = self.definition.error_boundary_for(&step.node.bpmn_id) {
                tracing::info!(
                    node = %step.node.bpmn_id,
                    boundary = %boundary.bpmn_id,
                    error = %error,
                    "Routing fault through boundary error event"
                );
                return Ok(StepAction::RouteTo(boundary.bpmn_id.clone()));
            }
            tracing::error!(node = %step.node.bpmn_id, error = %error, "Flow object faulted");
            return Ok(StepAction::Stop);
        }

        if ctx.control().take_pause() {
            let resume_at = step.next.unwrap_or(&step.node.bpmn_id).to_string();
            ctx.update_metadata(|meta| meta.state.last_flow_object = Some(resume_at));
            self.save_metadata(ctx).await?;
            self.client.set_status(ExecutionResult::Paused).await?;
            tracing::info!(node = %step.node.bpmn_id, "Process instance paused");
            return Ok(StepAction::Stop);
        }

        Ok(StepAction::Continue)
    }
}
