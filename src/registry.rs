//! Type-key registries consulted while building a runnable process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::Activity;
use crate::definition::FlowObject;
use crate::error::EngineError;
use crate::store::InstanceRecord;

/// Builds the activity that runs a typed flow object.
pub trait ActivityFactory: Send + Sync {
    fn create(&self, node: &FlowObject) -> Box<dyn Activity>;
}

impl<F> ActivityFactory for F
where
    F: Fn(&FlowObject) -> Box<dyn Activity> + Send + Sync,
{
    fn create(&self, node: &FlowObject) -> Box<dyn Activity> {
        self(node)
    }
}

/// Activity type key → factory.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    factories: HashMap<String, Arc<dyn ActivityFactory>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_key: impl Into<String>,
        factory: impl ActivityFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(type_key.into(), Arc::new(factory));
        self
    }

    pub fn with(mut self, type_key: impl Into<String>, factory: impl ActivityFactory + 'static) -> Self {
        self.register(type_key, factory);
        self
    }

    pub fn contains(&self, type_key: &str) -> bool {
        self.factories.contains_key(type_key)
    }

    pub fn type_keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn resolve(&self, type_key: &str) -> Result<Arc<dyn ActivityFactory>, EngineError> {
        self.factories
            .get(type_key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownActivityType(type_key.to_string()))
    }
}

/// Lazy data binding run before the start event. Its value becomes the
/// process data payload.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve_target(&self, record: &InstanceRecord) -> anyhow::Result<serde_json::Value>;
}

/// What the engine knows about a concrete instance type.
#[derive(Clone, Default)]
pub struct InstanceBinding {
    target: Option<Arc<dyn TargetResolver>>,
}

impl InstanceBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(resolver: impl TargetResolver + 'static) -> Self {
        Self {
            target: Some(Arc::new(resolver)),
        }
    }

    pub fn target_resolver(&self) -> Option<&Arc<dyn TargetResolver>> {
        self.target.as_ref()
    }
}

/// `additional_type` → binding. Unregistered types load as plain rows
/// without target resolution.
#[derive(Clone, Default)]
pub struct InstanceTypeRegistry {
    bindings: HashMap<String, InstanceBinding>,
}

impl InstanceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, additional_type: impl Into<String>, binding: InstanceBinding) -> &mut Self {
        self.bindings.insert(additional_type.into(), binding);
        self
    }

    pub fn get(&self, additional_type: &str) -> Option<&InstanceBinding> {
        self.bindings.get(additional_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::FlowNodeActivity;
    use crate::definition::FlowObjectKind;
    use crate::types::ProcessInstance;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn task(task_type: &str) -> FlowObject {
        FlowObject {
            bpmn_id: "Task_1".to_string(),
            name: Some("Reserve".to_string()),
            element: "task".to_string(),
            kind: FlowObjectKind::Task,
            task_type: Some(task_type.to_string()),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn closures_act_as_factories() {
        let registry = ActivityRegistry::new().with("reserve", |node: &FlowObject| {
            Box::new(FlowNodeActivity::new(node.label())) as Box<dyn Activity>
        });

        assert!(registry.contains("reserve"));
        assert_eq!(registry.type_keys().collect::<Vec<_>>(), vec!["reserve"]);
        let factory = registry.resolve("reserve").unwrap();
        let activity = factory.create(&task("reserve"));
        assert_eq!(activity.name(), "Reserve");
    }

    #[test]
    fn unknown_type_is_a_typed_error() {
        let registry = ActivityRegistry::new();
        match registry.resolve("ship") {
            Err(EngineError::UnknownActivityType(key)) => assert_eq!(key, "ship"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("resolved an unregistered type"),
        }
    }

    struct OrderLookup;

    #[async_trait]
    impl TargetResolver for OrderLookup {
        async fn resolve_target(&self, record: &InstanceRecord) -> anyhow::Result<serde_json::Value> {
            Ok(json!({ "order": record.fields["order"] }))
        }
    }

    #[tokio::test]
    async fn bindings_expose_optional_target_resolution() {
        let mut types = InstanceTypeRegistry::new();
        types
            .register("OrderProcess", InstanceBinding::with_target(OrderLookup))
            .register("AuditProcess", InstanceBinding::new());

        assert!(types.get("AuditProcess").unwrap().target_resolver().is_none());
        assert!(types.get("Unknown").is_none());

        let record = InstanceRecord {
            instance: ProcessInstance::new(Uuid::new_v4()),
            fields: json!({ "order": "SO-7" }),
        };
        let resolver = types.get("OrderProcess").unwrap().target_resolver().unwrap();
        assert_eq!(
            resolver.resolve_target(&record).await.unwrap(),
            json!({ "order": "SO-7" })
        );
    }
}
