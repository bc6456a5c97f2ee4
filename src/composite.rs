//! Composite activities: ordered children executed strictly in series.

use async_trait::async_trait;

use crate::activity::{Activity, ActivityCore, ActivityEvent};
use crate::context::ActivityContext;
use crate::error::ActivityError;
use crate::types::{ExecutionResult, ExecutionState};

/// Specialisation of a composite. Behavior is identical; the kind only
/// names what the container represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeKind {
    Composite,
    /// Whole process definition executed step by step.
    SequentialProcess,
    /// Root container of event-driven states.
    StateMachineProcess,
}

pub struct CompositeActivity {
    core: ActivityCore,
    kind: CompositeKind,
    /// Insertion order is execution order. `None` marks a structural node
    /// with nothing to run.
    activities: Option<Vec<Box<dyn Activity>>>,
}

impl CompositeActivity {
    pub fn new() -> Self {
        Self::with_kind(CompositeKind::Composite)
    }

    pub fn sequential_process() -> Self {
        Self::with_kind(CompositeKind::SequentialProcess)
    }

    pub fn state_machine_process() -> Self {
        Self::with_kind(CompositeKind::StateMachineProcess)
    }

    pub fn with_kind(kind: CompositeKind) -> Self {
        Self {
            core: ActivityCore::default(),
            kind,
            activities: Some(Vec::new()),
        }
    }

    /// A container without a child sequence; executing it is a no-op.
    pub fn structural() -> Self {
        Self {
            activities: None,
            ..Self::new()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.name = name.into();
        self
    }

    pub fn kind(&self) -> CompositeKind {
        self.kind
    }

    /// Attach a child at the end of the sequence.
    pub fn push(&mut self, mut child: Box<dyn Activity>) {
        child.core_mut().attach_to(self.core.id());
        self.activities.get_or_insert_with(Vec::new).push(child);
    }

    pub fn with(mut self, child: impl Activity + 'static) -> Self {
        self.push(Box::new(child));
        self
    }

    pub fn activities(&self) -> Option<&[Box<dyn Activity>]> {
        self.activities.as_deref()
    }

    pub fn activity_by_name(&self, name: &str) -> Option<&dyn Activity> {
        self.activities
            .as_ref()?
            .iter()
            .find(|a| a.name() == name)
            .map(|a| &**a)
    }
}

impl Default for CompositeActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Activity for CompositeActivity {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActivityCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        match self.kind {
            CompositeKind::Composite => "CompositeActivity",
            CompositeKind::SequentialProcess => "SequentialProcess",
            CompositeKind::StateMachineProcess => "StateMachineProcess",
        }
    }

    async fn execute(&mut self, ctx: &ActivityContext) -> ExecutionResult {
        if self.core.execution_state() != ExecutionState::Initialized {
            return self.core.execution_result();
        }

        let Some(children) = self.activities.as_mut() else {
            self.core.set_state(ExecutionState::Closed);
            self.core.set_result(ExecutionResult::Succeeded);
            return ExecutionResult::Succeeded;
        };

        self.core.set_state(ExecutionState::Executing);
        if let Err(e) = self.core.raise(ActivityEvent::Executing, None).await {
            return self.core.fault_and_close(e).await;
        }

        for child in children.iter_mut() {
            if !child.core().enabled {
                tracing::debug!(activity = %child.name(), "Skipping disabled child activity");
                continue;
            }
            if child.execute(ctx).await == ExecutionResult::Faulted {
                let error = ActivityError::ChildActivityFailed {
                    child: child.name().to_string(),
                };
                return self.core.fault_and_close(error).await;
            }
        }

        self.core.close(ExecutionResult::Succeeded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityListener, ActivityStateChangedEventArgs, FnListener};
    use std::sync::{Arc, Mutex};

    struct Step {
        core: ActivityCore,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Step {
        fn new(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                core: ActivityCore::named(name),
                fail,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl Activity for Step {
        fn core(&self) -> &ActivityCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ActivityCore {
            &mut self.core
        }

        async fn invoke(&mut self, _ctx: &ActivityContext) -> Result<(), ActivityError> {
            self.log.lock().unwrap().push(self.core.name.clone());
            if self.fail {
                return Err(ActivityError::invocation(self.core.name.clone(), "failed"));
            }
            Ok(())
        }
    }

    fn counting(counter: &Arc<Mutex<usize>>, fail: bool) -> Arc<dyn ActivityListener> {
        let counter = counter.clone();
        Arc::new(FnListener(move |_: &ActivityStateChangedEventArgs| {
            *counter.lock().unwrap() += 1;
            if fail {
                Err(ActivityError::listener("executing", "rejected"))
            } else {
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn children_run_in_order_and_succeed() {
        let log = Arc::default();
        let mut process = CompositeActivity::sequential_process()
            .with(Step::new("one", false, &log))
            .with(Step::new("two", false, &log))
            .with(Step::new("three", false, &log));

        let result = process.execute(&ActivityContext::detached()).await;

        assert_eq!(result, ExecutionResult::Succeeded);
        assert_eq!(*log.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(process.type_name(), "SequentialProcess");
        let children = process.activities().unwrap();
        assert!(children.iter().all(|c| c.succeeded()));
        assert!(children
            .iter()
            .all(|c| c.core().parent() == Some(process.core().id())));
    }

    #[tokio::test]
    async fn faulted_child_aborts_the_series() {
        let log = Arc::default();
        let mut composite = CompositeActivity::new()
            .with(Step::new("succeed-1", false, &log))
            .with(Step::new("fault", true, &log))
            .with(Step::new("succeed-2", false, &log));

        let result = composite.execute(&ActivityContext::detached()).await;

        assert_eq!(result, ExecutionResult::Faulted);
        assert!(composite.closed());
        assert_eq!(*log.lock().unwrap(), vec!["succeed-1", "fault"]);
        let third = composite.activity_by_name("succeed-2").unwrap();
        assert_eq!(third.execution_state(), ExecutionState::Initialized);
        assert_eq!(
            composite.core().fault(),
            Some(&ActivityError::ChildActivityFailed {
                child: "fault".to_string()
            })
        );
    }

    #[tokio::test]
    async fn absent_children_close_succeeded_without_events() {
        let executing = Arc::new(Mutex::new(0));
        let mut composite = CompositeActivity::structural();
        composite
            .core_mut()
            .on(ActivityEvent::Executing, counting(&executing, false))
            .on(ActivityEvent::Closed, counting(&executing, false));

        let result = composite.execute(&ActivityContext::detached()).await;

        assert_eq!(result, ExecutionResult::Succeeded);
        assert!(composite.closed());
        assert_eq!(*executing.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_sequence_raises_executing_and_succeeds() {
        let executing = Arc::new(Mutex::new(0));
        let mut composite = CompositeActivity::new();
        composite
            .core_mut()
            .on(ActivityEvent::Executing, counting(&executing, false));

        assert_eq!(
            composite.execute(&ActivityContext::detached()).await,
            ExecutionResult::Succeeded
        );
        assert_eq!(*executing.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn executing_listener_failure_skips_children() {
        let log = Arc::default();
        let executing = Arc::new(Mutex::new(0));
        let mut composite = CompositeActivity::new().with(Step::new("child", false, &log));
        composite
            .core_mut()
            .on(ActivityEvent::Executing, counting(&executing, true));

        let result = composite.execute(&ActivityContext::detached()).await;

        assert_eq!(result, ExecutionResult::Faulted);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(
            composite.activity_by_name("child").unwrap().execution_state(),
            ExecutionState::Initialized
        );
    }

    #[tokio::test]
    async fn disabled_children_are_skipped() {
        let log = Arc::default();
        let mut disabled = Step::new("disabled", true, &log);
        disabled.core_mut().enabled = false;
        let mut composite = CompositeActivity::new()
            .with(disabled)
            .with(Step::new("enabled", false, &log));

        assert_eq!(
            composite.execute(&ActivityContext::detached()).await,
            ExecutionResult::Succeeded
        );
        assert_eq!(*log.lock().unwrap(), vec!["enabled"]);
    }

    #[tokio::test]
    async fn nested_composites_propagate_faults() {
        let log = Arc::default();
        let inner = CompositeActivity::new()
            .named("inner")
            .with(Step::new("inner-fault", true, &log));
        let mut outer = CompositeActivity::state_machine_process()
            .with(inner)
            .with(Step::new("after", false, &log));

        assert_eq!(
            outer.execute(&ActivityContext::detached()).await,
            ExecutionResult::Faulted
        );
        assert_eq!(*log.lock().unwrap(), vec!["inner-fault"]);
        assert!(outer.activity_by_name("inner").unwrap().faulted());
    }
}
