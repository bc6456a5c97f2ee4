//! BPMN 2.0 process definitions.
//!
//! Only the first `process` element of a document is read. Elements are
//! matched on their local name so any namespace prefix (`bpmn:`, `bpmn2:`,
//! none) is accepted.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Document root is '{0}', expected BPMN definitions")]
    NotBpmn(String),

    #[error("Document does not contain a process element")]
    MissingProcess,

    #[error("<{element}> is missing required attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },

    #[error("{owner} references unknown flow object '{target}'")]
    DanglingReference { owner: String, target: String },
}

// ─── Model ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowObjectKind {
    StartEvent,
    EndEvent,
    Task,
    IntermediateEvent,
    Gateway,
    BoundaryEvent {
        attached_to: String,
        catches_errors: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowObject {
    pub bpmn_id: String,
    pub name: Option<String>,
    /// Local element name, e.g. `serviceTask`.
    pub element: String,
    pub kind: FlowObjectKind,
    /// Activity type key (`drools:taskName` and friends).
    pub task_type: Option<String>,
    /// All attributes keyed by local name.
    pub attributes: BTreeMap<String, String>,
}

impl FlowObject {
    /// Display name, falling back to the BPMN id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.bpmn_id)
    }

    pub fn is_start_event(&self) -> bool {
        self.kind == FlowObjectKind::StartEvent
    }

    pub fn is_end_event(&self) -> bool {
        self.kind == FlowObjectKind::EndEvent
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(self.kind, FlowObjectKind::BoundaryEvent { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceFlow {
    pub id: String,
    pub name: Option<String>,
    pub source_ref: String,
    pub target_ref: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: Option<String>,
    pub flow_objects: Vec<FlowObject>,
    pub sequence_flows: Vec<SequenceFlow>,
}

impl ProcessDefinition {
    pub fn parse(xml: &str) -> Result<Self, DefinitionError> {
        DefinitionParser::default().run(xml)
    }

    pub fn start_event(&self) -> Option<&FlowObject> {
        self.flow_objects.iter().find(|f| f.is_start_event())
    }

    pub fn flow_object(&self, bpmn_id: &str) -> Option<&FlowObject> {
        self.flow_objects.iter().find(|f| f.bpmn_id == bpmn_id)
    }

    pub fn outgoing(&self, bpmn_id: &str) -> Vec<&SequenceFlow> {
        self.sequence_flows
            .iter()
            .filter(|s| s.source_ref == bpmn_id)
            .collect()
    }

    /// Boundary event that catches errors raised by `bpmn_id`.
    pub fn error_boundary_for(&self, bpmn_id: &str) -> Option<&FlowObject> {
        self.flow_objects.iter().find(|f| {
            matches!(
                &f.kind,
                FlowObjectKind::BoundaryEvent { attached_to, catches_errors: true }
                    if attached_to == bpmn_id
            )
        })
    }

    /// Select flow objects with a small path expression, e.g.
    /// `process/startEvent`, `bpmn2:process/*[@id='Task_1']`.
    pub fn select(&self, path: &str) -> Vec<&FlowObject> {
        let mut segments: Vec<String> = path.trim_matches('/').split('/').map(local_step).collect();
        if segments.first().map(String::as_str) == Some("definitions") {
            segments.remove(0);
        }
        let [process, step] = segments.as_slice() else {
            return Vec::new();
        };
        if process != "process" {
            return Vec::new();
        }

        let (element, predicate) = match step.split_once('[') {
            Some((element, rest)) => (element, parse_predicate(rest.trim_end_matches(']'))),
            None => (step.as_str(), None),
        };

        self.flow_objects
            .iter()
            .filter(|f| element == "*" || f.element == element)
            .filter(|f| match &predicate {
                Some((attr, value)) => f.attributes.get(*attr).map(String::as_str) == Some(*value),
                None => true,
            })
            .collect()
    }

    pub fn select_single(&self, path: &str) -> Option<&FlowObject> {
        self.select(path).into_iter().next()
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// `bpmn2:task[@id='T']` → `task[@id='T']`
fn local_step(segment: &str) -> String {
    let (head, predicate) = match segment.find('[') {
        Some(i) => segment.split_at(i),
        None => (segment, ""),
    };
    format!("{}{predicate}", local(head))
}

/// `@id='Task_1'` → `("id", "Task_1")`
fn parse_predicate(raw: &str) -> Option<(&str, &str)> {
    let (attr, value) = raw.strip_prefix('@')?.split_once('=')?;
    let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
    Some((local(attr.trim()), value))
}

// ─── Parser ───────────────────────────────────────────────────

fn kind_of(element: &str) -> Option<FlowObjectKind> {
    let kind = match element {
        "startEvent" => FlowObjectKind::StartEvent,
        "endEvent" => FlowObjectKind::EndEvent,
        "task" | "serviceTask" | "userTask" | "scriptTask" | "sendTask" | "receiveTask"
        | "manualTask" | "businessRuleTask" | "callActivity" | "subProcess" => FlowObjectKind::Task,
        "intermediateCatchEvent" | "intermediateThrowEvent" => FlowObjectKind::IntermediateEvent,
        "exclusiveGateway" | "parallelGateway" | "inclusiveGateway" | "eventBasedGateway"
        | "complexGateway" => FlowObjectKind::Gateway,
        "boundaryEvent" => FlowObjectKind::BoundaryEvent {
            attached_to: String::new(),
            catches_errors: true,
        },
        _ => return None,
    };
    Some(kind)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn read_attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>, DefinitionError> {
    let mut attributes = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn required(
    attributes: &BTreeMap<String, String>,
    element: &str,
    attribute: &str,
) -> Result<String, DefinitionError> {
    attributes
        .get(attribute)
        .cloned()
        .ok_or_else(|| DefinitionError::MissingAttribute {
            element: element.to_string(),
            attribute: attribute.to_string(),
        })
}

/// Event definitions seen inside an open `boundaryEvent`.
#[derive(Default)]
struct OpenBoundary {
    index: usize,
    has_definition: bool,
    has_error_definition: bool,
}

#[derive(Default)]
struct DefinitionParser {
    stack: Vec<String>,
    process: Option<(String, Option<String>)>,
    /// Set once the first process element has been closed.
    process_done: bool,
    flow_objects: Vec<FlowObject>,
    sequence_flows: Vec<SequenceFlow>,
    boundary: Option<OpenBoundary>,
}

impl DefinitionParser {
    fn run(mut self, xml: &str) -> Result<ProcessDefinition, DefinitionError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let element = local_name(&e);
                    self.open(&e, &element, false)?;
                    self.stack.push(element);
                }
                Event::Empty(e) => {
                    let element = local_name(&e);
                    self.open(&e, &element, true)?;
                }
                Event::End(_) => {
                    if let Some(element) = self.stack.pop() {
                        self.close(&element);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let (id, name) = self.process.ok_or(DefinitionError::MissingProcess)?;
        let definition = ProcessDefinition {
            id,
            name,
            flow_objects: self.flow_objects,
            sequence_flows: self.sequence_flows,
        };
        validate(&definition)?;
        Ok(definition)
    }

    fn in_first_process(&self) -> bool {
        !self.process_done
            && self.process.is_some()
            && self.stack.len() == 2
            && self.stack[1] == "process"
    }

    fn open(&mut self, e: &BytesStart<'_>, element: &str, empty: bool) -> Result<(), DefinitionError> {
        if self.stack.is_empty() && element != "definitions" {
            return Err(DefinitionError::NotBpmn(element.to_string()));
        }

        if self.stack.len() == 1 && element == "process" {
            if self.process.is_none() {
                let attributes = read_attributes(e)?;
                let id = required(&attributes, element, "id")?;
                self.process = Some((id, attributes.get("name").cloned()));
                if empty {
                    self.process_done = true;
                }
            } else {
                self.process_done = true;
            }
            return Ok(());
        }

        if let Some(boundary) = self.boundary.as_mut() {
            if self.stack.len() == 3 && element.ends_with("EventDefinition") {
                boundary.has_definition = true;
                if element == "errorEventDefinition" {
                    boundary.has_error_definition = true;
                }
            }
            return Ok(());
        }

        if !self.in_first_process() {
            return Ok(());
        }

        if element == "sequenceFlow" {
            let attributes = read_attributes(e)?;
            self.sequence_flows.push(SequenceFlow {
                id: required(&attributes, element, "id")?,
                name: attributes.get("name").cloned(),
                source_ref: required(&attributes, element, "sourceRef")?,
                target_ref: required(&attributes, element, "targetRef")?,
            });
            return Ok(());
        }

        let Some(mut kind) = kind_of(element) else {
            return Ok(());
        };
        let attributes = read_attributes(e)?;
        if let FlowObjectKind::BoundaryEvent { attached_to, .. } = &mut kind {
            *attached_to = required(&attributes, element, "attachedToRef")?;
        }
        self.flow_objects.push(FlowObject {
            bpmn_id: required(&attributes, element, "id")?,
            name: attributes.get("name").cloned(),
            element: element.to_string(),
            kind,
            task_type: attributes.get("taskName").cloned(),
            attributes,
        });

        if element == "boundaryEvent" && !empty {
            self.boundary = Some(OpenBoundary {
                index: self.flow_objects.len() - 1,
                ..OpenBoundary::default()
            });
        }
        Ok(())
    }

    fn close(&mut self, element: &str) {
        if element == "boundaryEvent" && self.stack.len() == 2 {
            if let Some(open) = self.boundary.take() {
                if let Some(FlowObjectKind::BoundaryEvent { catches_errors, .. }) =
                    self.flow_objects.get_mut(open.index).map(|f| &mut f.kind)
                {
                    *catches_errors = open.has_error_definition || !open.has_definition;
                }
            }
        }
        if element == "process" && self.stack.len() == 1 && self.process.is_some() {
            self.process_done = true;
        }
    }
}

fn validate(definition: &ProcessDefinition) -> Result<(), DefinitionError> {
    let known = |id: &str| definition.flow_objects.iter().any(|f| f.bpmn_id == id);
    for flow in &definition.sequence_flows {
        for target in [&flow.source_ref, &flow.target_ref] {
            if !known(target) {
                return Err(DefinitionError::DanglingReference {
                    owner: format!("sequenceFlow '{}'", flow.id),
                    target: target.clone(),
                });
            }
        }
    }
    for object in &definition.flow_objects {
        if let FlowObjectKind::BoundaryEvent { attached_to, .. } = &object.kind {
            if !known(attached_to) {
                return Err(DefinitionError::DanglingReference {
                    owner: format!("boundaryEvent '{}'", object.bpmn_id),
                    target: attached_to.clone(),
                });
            }
        }
    }
    Ok(())
}

// ─── Loaders ──────────────────────────────────────────────────

/// Resolves a template URL to a parsed definition.
#[async_trait]
pub trait DefinitionLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<ProcessDefinition, DefinitionError>;
}

/// Reads definition documents from a directory tree.
pub struct FileDefinitionLoader {
    root: PathBuf,
}

impl FileDefinitionLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root.join(url.trim_start_matches('/'))
    }
}

#[async_trait]
impl DefinitionLoader for FileDefinitionLoader {
    async fn load(&self, url: &str) -> Result<ProcessDefinition, DefinitionError> {
        let path = self.path_for(url);
        tracing::debug!(path = %path.display(), "Loading process definition");
        let xml = tokio::fs::read_to_string(&path).await?;
        ProcessDefinition::parse(&xml)
    }
}

/// Definitions held in memory, keyed by URL.
#[derive(Default)]
pub struct MemoryDefinitionLoader {
    documents: RwLock<HashMap<String, String>>,
}

impl MemoryDefinitionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, xml: impl Into<String>) {
        match self.documents.write() {
            Ok(mut docs) => {
                docs.insert(url.into(), xml.into());
            }
            Err(e) => tracing::error!(error = %e, "Definition map lock poisoned"),
        }
    }

    pub fn with(self, url: impl Into<String>, xml: impl Into<String>) -> Self {
        self.insert(url, xml);
        self
    }
}

#[async_trait]
impl DefinitionLoader for MemoryDefinitionLoader {
    async fn load(&self, url: &str) -> Result<ProcessDefinition, DefinitionError> {
        let xml = {
            let docs = self
                .documents
                .read()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            docs.get(url).cloned()
        };
        let xml = xml.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No definition registered for {url}"),
            )
        })?;
        ProcessDefinition::parse(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn2:definitions xmlns:bpmn2="http://www.omg.org/spec/BPMN/20100524/MODEL"
                   xmlns:drools="http://www.jboss.org/drools" id="Definitions_1">
  <bpmn2:process id="OrderProcess" name="Order">
    <bpmn2:startEvent id="StartEvent_1" name="Start">
      <bpmn2:outgoing>Flow_1</bpmn2:outgoing>
    </bpmn2:startEvent>
    <bpmn2:task id="Task_1" name="Reserve stock" drools:taskName="reserve"/>
    <bpmn2:boundaryEvent id="Boundary_1" attachedToRef="Task_1">
      <bpmn2:errorEventDefinition id="ErrorDef_1"/>
    </bpmn2:boundaryEvent>
    <bpmn2:boundaryEvent id="Timer_1" attachedToRef="Task_1">
      <bpmn2:timerEventDefinition id="TimerDef_1"/>
    </bpmn2:boundaryEvent>
    <bpmn2:endEvent id="EndEvent_1" name="Done"/>
    <bpmn2:endEvent id="EndEvent_2" name="Compensated"/>
    <bpmn2:sequenceFlow id="Flow_1" sourceRef="StartEvent_1" targetRef="Task_1"/>
    <bpmn2:sequenceFlow id="Flow_2" sourceRef="Task_1" targetRef="EndEvent_1"/>
    <bpmn2:sequenceFlow id="Flow_3" sourceRef="Boundary_1" targetRef="EndEvent_2"/>
  </bpmn2:process>
  <bpmn2:process id="Ignored">
    <bpmn2:startEvent id="Other_Start"/>
  </bpmn2:process>
</bpmn2:definitions>"#;

    #[test]
    fn parses_first_process_graph() {
        let def = ProcessDefinition::parse(ORDER).unwrap();

        assert_eq!(def.id, "OrderProcess");
        assert_eq!(def.name.as_deref(), Some("Order"));
        assert_eq!(def.flow_objects.len(), 6);
        assert_eq!(def.sequence_flows.len(), 3);
        assert!(def.flow_object("Other_Start").is_none());

        let start = def.start_event().unwrap();
        assert_eq!(start.bpmn_id, "StartEvent_1");
        assert_eq!(start.label(), "Start");

        let task = def.flow_object("Task_1").unwrap();
        assert_eq!(task.kind, FlowObjectKind::Task);
        assert_eq!(task.task_type.as_deref(), Some("reserve"));

        let outgoing = def.outgoing("Task_1");
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target_ref, "EndEvent_1");
    }

    #[test]
    fn error_boundary_ignores_timer_boundaries() {
        let def = ProcessDefinition::parse(ORDER).unwrap();
        let boundary = def.error_boundary_for("Task_1").unwrap();
        assert_eq!(boundary.bpmn_id, "Boundary_1");
        assert!(boundary.is_boundary_event());

        let timer = def.flow_object("Timer_1").unwrap();
        assert_eq!(
            timer.kind,
            FlowObjectKind::BoundaryEvent {
                attached_to: "Task_1".to_string(),
                catches_errors: false
            }
        );
        assert!(def.error_boundary_for("EndEvent_1").is_none());
    }

    #[test]
    fn select_supports_prefixes_wildcards_and_id_predicates() {
        let def = ProcessDefinition::parse(ORDER).unwrap();

        let start = def
            .select_single("bpmn2:definitions/bpmn2:process/bpmn2:startEvent")
            .unwrap();
        assert_eq!(start.bpmn_id, "StartEvent_1");

        assert_eq!(def.select("process/endEvent").len(), 2);

        let by_id = def.select_single("process/*[@id='EndEvent_2']").unwrap();
        assert_eq!(by_id.label(), "Compensated");

        let by_task = def.select_single("process/task[@drools:taskName=\"reserve\"]").unwrap();
        assert_eq!(by_task.bpmn_id, "Task_1");

        assert!(def.select("collaboration/task").is_empty());
    }

    #[test]
    fn rejects_non_bpmn_and_missing_process() {
        assert!(matches!(
            ProcessDefinition::parse("<html><body/></html>"),
            Err(DefinitionError::NotBpmn(root)) if root == "html"
        ));
        assert!(matches!(
            ProcessDefinition::parse(r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"/>"#),
            Err(DefinitionError::MissingProcess)
        ));
    }

    #[test]
    fn rejects_dangling_sequence_flow() {
        let xml = r#"<definitions>
            <process id="P">
              <startEvent id="S"/>
              <sequenceFlow id="F" sourceRef="S" targetRef="Nowhere"/>
            </process>
          </definitions>"#;
        assert!(matches!(
            ProcessDefinition::parse(xml),
            Err(DefinitionError::DanglingReference { target, .. }) if target == "Nowhere"
        ));
    }

    #[test]
    fn malformed_xml_is_an_xml_error() {
        let xml = "<definitions><process id=\"P\"><startEvent id=\"S\"></process></definitions>";
        assert!(matches!(
            ProcessDefinition::parse(xml),
            Err(DefinitionError::Xml(_))
        ));
    }

    #[tokio::test]
    async fn file_loader_resolves_relative_urls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("processes")).unwrap();
        std::fs::write(dir.path().join("processes/order.bpmn"), ORDER).unwrap();

        let loader = FileDefinitionLoader::new(dir.path());
        let def = loader.load("/processes/order.bpmn").await.unwrap();
        assert_eq!(def.id, "OrderProcess");

        let missing = loader.load("processes/missing.bpmn").await;
        assert!(matches!(missing, Err(DefinitionError::Io(_))));
    }

    #[tokio::test]
    async fn memory_loader_reports_unknown_urls() {
        let loader = MemoryDefinitionLoader::new().with("order.bpmn", ORDER);
        assert!(loader.load("order.bpmn").await.is_ok());
        assert!(matches!(
            loader.load("other.bpmn").await,
            Err(DefinitionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound
        ));
    }
}
