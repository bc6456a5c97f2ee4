//! Activity execution state machine.
//!
//! ```text
//! Initialized → Executing → Closed(Succeeded)
//!                         → Faulting → Closed(Faulted)
//!             → Canceling → Closed(Canceled | Faulted)
//! ```
//!
//! Every transition raises a lifecycle event. Listeners registered for an
//! event run strictly one after another; the first error stops the chain and
//! is handed back to the transition that raised the event.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::ActivityContext;
use crate::error::ActivityError;
use crate::types::{ExecutionResult, ExecutionState};

// ─── Events ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityEvent {
    Initializing,
    Executing,
    Faulting,
    Canceling,
    Closed,
}

impl ActivityEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Executing => "executing",
            Self::Faulting => "faulting",
            Self::Canceling => "canceling",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ActivityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the activity that raised an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityRef {
    pub id: Uuid,
    pub name: String,
}

/// Snapshot taken when an event is raised.
#[derive(Clone, Debug)]
pub struct ActivityStateChangedEventArgs {
    pub event: ActivityEvent,
    pub execution_state: ExecutionState,
    pub execution_result: ExecutionResult,
    pub activity: ActivityRef,
    pub error: Option<ActivityError>,
}

// ─── Listeners ────────────────────────────────────────────────

#[async_trait]
pub trait ActivityListener: Send + Sync {
    async fn on_event(&self, args: &ActivityStateChangedEventArgs) -> Result<(), ActivityError>;
}

/// Adapts a synchronous closure into a listener.
pub struct FnListener<F>(pub F);

#[async_trait]
impl<F> ActivityListener for FnListener<F>
where
    F: Fn(&ActivityStateChangedEventArgs) -> Result<(), ActivityError> + Send + Sync,
{
    async fn on_event(&self, args: &ActivityStateChangedEventArgs) -> Result<(), ActivityError> {
        (self.0)(args)
    }
}

#[derive(Clone)]
struct ListenerEntry {
    seq: u64,
    listener: Arc<dyn ActivityListener>,
    once: bool,
}

/// Ordered listener lists, one per lifecycle event.
#[derive(Clone, Default)]
pub struct ActivityListeners {
    by_event: BTreeMap<ActivityEvent, Vec<ListenerEntry>>,
    next_seq: u64,
}

impl ActivityListeners {
    pub fn on(&mut self, event: ActivityEvent, listener: Arc<dyn ActivityListener>) {
        self.add(event, listener, false);
    }

    /// Register a listener that is dropped after its first invocation.
    pub fn once(&mut self, event: ActivityEvent, listener: Arc<dyn ActivityListener>) {
        self.add(event, listener, true);
    }

    fn add(&mut self, event: ActivityEvent, listener: Arc<dyn ActivityListener>, once: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_event.entry(event).or_default().push(ListenerEntry {
            seq,
            listener,
            once,
        });
    }

    pub fn count(&self, event: ActivityEvent) -> usize {
        self.by_event.get(&event).map(Vec::len).unwrap_or(0)
    }

    /// Run the listeners of `args.event` in registration order.
    pub async fn emit(&mut self, args: &ActivityStateChangedEventArgs) -> Result<(), ActivityError> {
        let snapshot = match self.by_event.get(&args.event) {
            Some(entries) if !entries.is_empty() => entries.clone(),
            _ => return Ok(()),
        };

        let mut fired_once = HashSet::new();
        let mut outcome = Ok(());
        for entry in snapshot {
            if entry.once {
                fired_once.insert(entry.seq);
            }
            if let Err(e) = entry.listener.on_event(args).await {
                outcome = Err(e);
                break;
            }
        }

        if !fired_once.is_empty() {
            if let Some(entries) = self.by_event.get_mut(&args.event) {
                entries.retain(|e| !fired_once.contains(&e.seq));
            }
        }
        outcome
    }
}

// ─── Core state ───────────────────────────────────────────────

/// Attributes and lifecycle state shared by every activity.
pub struct ActivityCore {
    id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Opaque payload attached by the invoking logic.
    pub data: Option<serde_json::Value>,
    parent: Option<Uuid>,
    execution_state: ExecutionState,
    execution_result: ExecutionResult,
    fault: Option<ActivityError>,
    listeners: ActivityListeners,
}

impl Default for ActivityCore {
    fn default() -> Self {
        let id = Uuid::now_v7();
        let simple = id.simple().to_string();
        Self {
            id,
            name: format!("Activity_{}", &simple[simple.len() - 8..]),
            description: String::new(),
            enabled: true,
            data: None,
            parent: None,
            execution_state: ExecutionState::Initialized,
            execution_result: ExecutionResult::None,
            fault: None,
            listeners: ActivityListeners::default(),
        }
    }
}

impl ActivityCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the composite this activity is attached to. Never owning.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub(crate) fn attach_to(&mut self, parent: Uuid) {
        self.parent = Some(parent);
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.execution_state
    }

    pub fn execution_result(&self) -> ExecutionResult {
        self.execution_result
    }

    /// Error that drove the last attempt into `Faulted`.
    pub fn fault(&self) -> Option<&ActivityError> {
        self.fault.as_ref()
    }

    pub fn listeners(&self) -> &ActivityListeners {
        &self.listeners
    }

    pub fn on(&mut self, event: ActivityEvent, listener: Arc<dyn ActivityListener>) -> &mut Self {
        self.listeners.on(event, listener);
        self
    }

    pub fn once(&mut self, event: ActivityEvent, listener: Arc<dyn ActivityListener>) -> &mut Self {
        self.listeners.once(event, listener);
        self
    }

    pub(crate) fn set_state(&mut self, state: ExecutionState) {
        self.execution_state = state;
    }

    pub(crate) fn set_result(&mut self, result: ExecutionResult) {
        self.execution_result = result;
    }

    fn snapshot(&self, event: ActivityEvent, error: Option<ActivityError>) -> ActivityStateChangedEventArgs {
        ActivityStateChangedEventArgs {
            event,
            execution_state: self.execution_state,
            execution_result: self.execution_result,
            activity: ActivityRef {
                id: self.id,
                name: self.name.clone(),
            },
            error,
        }
    }

    /// Raise `event` and surface the first listener error.
    pub(crate) async fn raise(
        &mut self,
        event: ActivityEvent,
        error: Option<ActivityError>,
    ) -> Result<(), ActivityError> {
        let args = self.snapshot(event, error);
        self.listeners.emit(&args).await
    }

    /// Raise `event` where a listener failure cannot change the outcome.
    pub(crate) async fn raise_logged(&mut self, event: ActivityEvent, error: Option<ActivityError>) {
        if let Err(e) = self.raise(event, error).await {
            tracing::warn!(
                activity = %self.name,
                event = %event,
                error = %e,
                "Activity listener failed"
            );
        }
    }

    pub(crate) async fn close(&mut self, result: ExecutionResult) -> ExecutionResult {
        self.execution_state = ExecutionState::Closed;
        self.execution_result = result;
        self.raise_logged(ActivityEvent::Closed, None).await;
        result
    }

    /// Faulting → Closed(Faulted).
    pub(crate) async fn fault_and_close(&mut self, error: ActivityError) -> ExecutionResult {
        tracing::debug!(activity = %self.name, error = %error, "Activity faulting");
        self.execution_state = ExecutionState::Faulting;
        self.fault = Some(error.clone());
        self.raise_logged(ActivityEvent::Faulting, Some(error)).await;
        self.close(ExecutionResult::Faulted).await
    }
}

impl std::fmt::Debug for ActivityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("execution_state", &self.execution_state)
            .field("execution_result", &self.execution_result)
            .field("fault", &self.fault)
            .finish()
    }
}

// ─── Activity trait ───────────────────────────────────────────

/// A node of the execution graph. Implementors supply `invoke`; the
/// lifecycle methods drive the state machine around it.
#[async_trait]
pub trait Activity: Send + Sync {
    fn core(&self) -> &ActivityCore;

    fn core_mut(&mut self) -> &mut ActivityCore;

    fn type_name(&self) -> &'static str {
        "Activity"
    }

    /// The activity's own work. Default: immediate success.
    async fn invoke(&mut self, _ctx: &ActivityContext) -> Result<(), ActivityError> {
        Ok(())
    }

    /// Run one execution attempt and return the result it closed with.
    /// Only valid from `Initialized`; otherwise a silent no-op.
    async fn execute(&mut self, ctx: &ActivityContext) -> ExecutionResult {
        execute_activity(self, ctx).await
    }

    async fn cancel(&mut self, _ctx: &ActivityContext) -> ExecutionResult {
        cancel_activity(self.core_mut()).await
    }

    /// Reset to `Initialized`/`None` for a fresh attempt.
    async fn initialize(&mut self, _ctx: &ActivityContext) {
        initialize_activity(self.core_mut()).await
    }

    fn name(&self) -> &str {
        &self.core().name
    }

    fn execution_state(&self) -> ExecutionState {
        self.core().execution_state()
    }

    fn execution_result(&self) -> ExecutionResult {
        self.core().execution_result()
    }

    fn closed(&self) -> bool {
        self.execution_state() == ExecutionState::Closed
    }

    fn faulted(&self) -> bool {
        self.execution_result() == ExecutionResult::Faulted
    }

    fn succeeded(&self) -> bool {
        self.execution_result() == ExecutionResult::Succeeded
    }

    fn canceled(&self) -> bool {
        self.execution_result() == ExecutionResult::Canceled
    }
}

/// Default `execute` transition sequence for leaf activities.
pub async fn execute_activity<A>(activity: &mut A, ctx: &ActivityContext) -> ExecutionResult
where
    A: Activity + ?Sized,
{
    if activity.core().execution_state() != ExecutionState::Initialized {
        tracing::debug!(
            activity = %activity.name(),
            state = %activity.execution_state(),
            "Activity is not initialized; skipping execution"
        );
        return activity.execution_result();
    }

    let core = activity.core_mut();
    core.set_state(ExecutionState::Executing);
    if let Err(e) = core.raise(ActivityEvent::Executing, None).await {
        return core.fault_and_close(e).await;
    }

    match activity.invoke(ctx).await {
        Ok(()) => activity.core_mut().close(ExecutionResult::Succeeded).await,
        Err(e) => activity.core_mut().fault_and_close(e).await,
    }
}

pub async fn cancel_activity(core: &mut ActivityCore) -> ExecutionResult {
    core.set_state(ExecutionState::Canceling);
    match core.raise(ActivityEvent::Canceling, None).await {
        Ok(()) => core.close(ExecutionResult::Canceled).await,
        Err(e) => {
            core.fault = Some(e);
            core.close(ExecutionResult::Faulted).await
        }
    }
}

pub async fn initialize_activity(core: &mut ActivityCore) {
    core.set_state(ExecutionState::Initialized);
    core.set_result(ExecutionResult::None);
    core.fault = None;
    core.raise_logged(ActivityEvent::Initializing, None).await;
}

// ─── Built-in activities ──────────────────────────────────────

/// Pass-through activity used for flow objects without custom behavior
/// (start/end events, untyped tasks, intermediate events).
#[derive(Debug, Default)]
pub struct FlowNodeActivity {
    core: ActivityCore,
}

impl FlowNodeActivity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: ActivityCore::named(name),
        }
    }
}

#[async_trait]
impl Activity for FlowNodeActivity {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActivityCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        "FlowNodeActivity"
    }
}
