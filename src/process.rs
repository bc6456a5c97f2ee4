//! Executable process built from a definition.
//!
//! The token walks linear sequence flows from the start event (or a resume
//! node). Every flow object runs as a fresh activity, bracketed by the step
//! hooks which own persistence and routing policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, FlowNodeActivity};
use crate::context::ActivityContext;
use crate::definition::{FlowObject, ProcessDefinition};
use crate::error::{ActivityError, EngineError};
use crate::registry::{ActivityFactory, ActivityRegistry};
use crate::types::ExecutionResult;

/// What to do after a step closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Follow the node's outgoing sequence flow.
    Continue,
    /// Jump to another flow object, e.g. an error boundary event.
    RouteTo(String),
    Stop,
}

/// A closed step as seen by `StepHooks::on_end`.
#[derive(Debug)]
pub struct StepOutcome<'a> {
    pub node: &'a FlowObject,
    pub result: ExecutionResult,
    pub error: Option<&'a ActivityError>,
    /// End event, or a node without outgoing flows.
    pub is_terminal: bool,
    /// Target of the single outgoing flow, when there is exactly one.
    pub next: Option<&'a str>,
}

impl StepOutcome<'_> {
    pub fn failed(&self) -> bool {
        self.result == ExecutionResult::Faulted
    }
}

#[async_trait]
pub trait StepHooks: Send + Sync {
    async fn on_begin(&self, node: &FlowObject, ctx: &ActivityContext) -> Result<(), EngineError>;

    async fn on_end(
        &self,
        step: &StepOutcome<'_>,
        ctx: &ActivityContext,
    ) -> Result<StepAction, EngineError>;
}

/// Where a walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub last_node: String,
    pub result: ExecutionResult,
    pub steps: usize,
}

pub struct FlowProcess {
    definition: Arc<ProcessDefinition>,
    /// Factories for typed tasks keyed by BPMN id.
    factories: HashMap<String, Arc<dyn ActivityFactory>>,
}

impl FlowProcess {
    /// Resolve every typed task once. Unknown activity types fail here,
    /// before anything runs.
    pub fn build(
        definition: Arc<ProcessDefinition>,
        registry: &ActivityRegistry,
    ) -> Result<Self, EngineError> {
        let mut factories = HashMap::new();
        for node in &definition.flow_objects {
            if let Some(task_type) = &node.task_type {
                factories.insert(node.bpmn_id.clone(), registry.resolve(task_type)?);
            }
        }
        Ok(Self {
            definition,
            factories,
        })
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    /// A fresh activity for one visit of `node`.
    pub fn activity_for(&self, node: &FlowObject) -> Box<dyn Activity> {
        let mut activity = match self.factories.get(&node.bpmn_id) {
            Some(factory) => factory.create(node),
            None => Box::new(FlowNodeActivity::new(node.label())),
        };
        if activity.core().description.is_empty() {
            activity.core_mut().description = node.element.clone();
        }
        activity
    }

    fn node(&self, bpmn_id: &str) -> Result<&FlowObject, EngineError> {
        self.definition
            .flow_object(bpmn_id)
            .ok_or_else(|| EngineError::UnknownFlowObject(bpmn_id.to_string()))
    }

    pub async fn run(
        &self,
        from: &str,
        ctx: &ActivityContext,
        hooks: &dyn StepHooks,
    ) -> Result<ProcessOutcome, EngineError> {
        let mut current = self.node(from)?;
        let mut steps = 0;

        loop {
            hooks.on_begin(current, ctx).await?;

            let mut activity = self.activity_for(current);
            let result = activity.execute(ctx).await;
            steps += 1;
            tracing::debug!(
                node = %current.bpmn_id,
                activity = %activity.name(),
                result = %result,
                "Flow object closed"
            );

            let outgoing = self.definition.outgoing(&current.bpmn_id);
            let is_terminal = current.is_end_event() || outgoing.is_empty();
            let next = match outgoing.as_slice() {
                [single] => Some(single.target_ref.as_str()),
                _ => None,
            };
            let step = StepOutcome {
                node: current,
                result,
                error: activity.core().fault(),
                is_terminal,
                next,
            };

            let stop = ProcessOutcome {
                last_node: current.bpmn_id.clone(),
                result,
                steps,
            };
            match hooks.on_end(&step, ctx).await? {
                StepAction::Stop => return Ok(stop),
                StepAction::RouteTo(target) => current = self.node(&target)?,
                StepAction::Continue => {
                    if is_terminal || step.failed() {
                        return Ok(stop);
                    }
                    let Some(target) = next else {
                        return Err(EngineError::UnsupportedFlow {
                            node: current.bpmn_id.clone(),
                            outgoing: outgoing.len(),
                        });
                    };
                    current = self.node(target)?;
                }
            }
        }
    }
}
