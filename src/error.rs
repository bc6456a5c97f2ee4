//! Error taxonomy for the process engine.
//!
//! `ActivityError` travels through the activity state machine and is kept on
//! closed activities, so it stays `Clone` and carries messages only.
//! `EngineError` is what the load pipeline reports for one instance attempt;
//! the scheduler logs it and moves on to the next instance.

use uuid::Uuid;

use crate::definition::DefinitionError;

/// Failure raised inside an activity execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    #[error("{event} listener failed: {message}")]
    Listener { event: String, message: String },

    #[error("activity '{activity}' failed: {message}")]
    Invocation { activity: String, message: String },

    #[error("A child activity was failed: {child}")]
    ChildActivityFailed { child: String },

    #[error("{0}")]
    Other(String),
}

impl ActivityError {
    pub fn invocation(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invocation {
            activity: activity.into(),
            message: message.into(),
        }
    }

    pub fn listener(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Listener {
            event: event.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ActivityError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(format!("{e:#}"))
    }
}

/// Failure of a single instance load-and-execute attempt.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("The associated business process template cannot be found for instance with ID {instance_id}")]
    TemplateNotFound { instance_id: Uuid },

    #[error("Instance object cannot be found ({additional_type} {instance_id})")]
    InstanceObjectNotFound {
        additional_type: String,
        instance_id: Uuid,
    },

    #[error("Error loading business process template XML for {template}")]
    DefinitionLoad {
        template: String,
        #[source]
        source: DefinitionError,
    },

    #[error("Process start event cannot be found for template {template}")]
    StartEventNotFound { template: String },

    #[error("Unknown activity type: {0}")]
    UnknownActivityType(String),

    #[error("Flow object '{node}' has {outgoing} outgoing sequence flows; only linear flows are supported")]
    UnsupportedFlow { node: String, outgoing: usize },

    #[error("Flow object '{0}' is not part of the process definition")]
    UnknownFlowObject(String),

    #[error("Target resolution failed for instance {instance_id}: {message}")]
    TargetResolution { instance_id: Uuid, message: String },

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// True for errors that only concern the current instance attempt and
    /// never the engine itself.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound { .. }
                | Self::InstanceObjectNotFound { .. }
                | Self::StartEventNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_conversion_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("saving instance");
        let activity_err: ActivityError = err.into();
        assert_eq!(activity_err.to_string(), "saving instance: disk full");
    }

    #[test]
    fn definition_errors_are_wrapped_with_template_name() {
        let err = EngineError::DefinitionLoad {
            template: "Order Approval".to_string(),
            source: DefinitionError::MissingProcess,
        };
        assert_eq!(
            err.to_string(),
            "Error loading business process template XML for Order Approval"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_not_found());
    }
}
