use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Model name of the base instance type. Instances whose `additional_type`
/// differs are re-read through their concrete type.
pub const BASE_INSTANCE_TYPE: &str = "ProcessInstance";

// ─── Execution result ─────────────────────────────────────────

/// Qualifies an activity that reached `Closed`. `Started` and `Paused` are
/// engine-level extensions used only for instance status tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionResult {
    #[default]
    None,
    Succeeded,
    Canceled,
    Compensated,
    Faulted,
    Uninitialized,
    Started,
    Paused,
}

impl ExecutionResult {
    /// Stable integer code used by persisted status columns.
    pub fn code(self) -> i32 {
        match self {
            Self::None => 1,
            Self::Succeeded => 2,
            Self::Canceled => 3,
            Self::Compensated => 4,
            Self::Faulted => 5,
            Self::Uninitialized => 6,
            Self::Started => 7,
            Self::Paused => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Succeeded => "Succeeded",
            Self::Canceled => "Canceled",
            Self::Compensated => "Compensated",
            Self::Faulted => "Faulted",
            Self::Uninitialized => "Uninitialized",
            Self::Started => "Started",
            Self::Paused => "Paused",
        }
    }
}

impl TryFrom<i32> for ExecutionResult {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::None),
            2 => Ok(Self::Succeeded),
            3 => Ok(Self::Canceled),
            4 => Ok(Self::Compensated),
            5 => Ok(Self::Faulted),
            6 => Ok(Self::Uninitialized),
            7 => Ok(Self::Started),
            8 => Ok(Self::Paused),
            _ => Err(format!("Unknown execution result code: {}", code)),
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Execution state ──────────────────────────────────────────

/// Lifecycle position of an activity within a single execution attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionState {
    #[default]
    Initialized,
    Executing,
    Canceling,
    Closed,
    Compensating,
    Faulting,
    Pausing,
}

impl ExecutionState {
    pub fn code(self) -> i32 {
        match self {
            Self::Initialized => 1,
            Self::Executing => 2,
            Self::Canceling => 3,
            Self::Closed => 4,
            Self::Compensating => 5,
            Self::Faulting => 6,
            Self::Pausing => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Executing => "Executing",
            Self::Canceling => "Canceling",
            Self::Closed => "Closed",
            Self::Compensating => "Compensating",
            Self::Faulting => "Faulting",
            Self::Pausing => "Pausing",
        }
    }
}

impl TryFrom<i32> for ExecutionState {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Initialized),
            2 => Ok(Self::Executing),
            3 => Ok(Self::Canceling),
            4 => Ok(Self::Closed),
            5 => Ok(Self::Compensating),
            6 => Ok(Self::Faulting),
            7 => Ok(Self::Pausing),
            _ => Err(format!("Unknown execution state code: {}", code)),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Persisted entities ───────────────────────────────────────

/// A process instance row as owned by the storage collaborator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub status: ExecutionResult,
    /// Earliest time the scheduler may pick this instance up.
    pub execution_date: Option<DateTime<Utc>>,
    pub bad_execution_count: u32,
    pub template_id: Uuid,
    /// Concrete model name; `BASE_INSTANCE_TYPE` unless specialised.
    pub additional_type: String,
    /// Serialized `InstanceMetadata`.
    pub metadata: Option<String>,
}

impl ProcessInstance {
    pub fn new(template_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            status: ExecutionResult::None,
            execution_date: Some(Utc::now()),
            bad_execution_count: 0,
            template_id,
            additional_type: BASE_INSTANCE_TYPE.to_string(),
            metadata: None,
        }
    }

    pub fn with_additional_type(mut self, additional_type: impl Into<String>) -> Self {
        self.additional_type = additional_type.into();
        self
    }

    pub fn with_execution_date(mut self, at: DateTime<Utc>) -> Self {
        self.execution_date = Some(at);
        self
    }

    pub fn is_base_type(&self) -> bool {
        self.additional_type.is_empty() || self.additional_type == BASE_INSTANCE_TYPE
    }

    /// Decoded metadata blob. Absent or malformed blobs read as the default.
    pub fn read_metadata(&self) -> InstanceMetadata {
        self.metadata
            .as_deref()
            .map(InstanceMetadata::parse)
            .unwrap_or_default()
    }

    pub fn write_metadata(&mut self, metadata: &InstanceMetadata) -> serde_json::Result<()> {
        self.metadata = Some(serde_json::to_string(metadata)?);
        Ok(())
    }
}

/// Id-only projection returned by the scheduler query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub id: Uuid,
}

impl From<Uuid> for InstanceRef {
    fn from(id: Uuid) -> Self {
        Self { id }
    }
}

/// Process definition template: where the BPMN document lives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessTemplate {
    pub id: Uuid,
    pub name: String,
    /// Path of the definition document, relative to the definitions root.
    pub url: String,
}

impl ProcessTemplate {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            url: url.into(),
        }
    }
}

/// One history record appended through the instance client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessLogEntry {
    pub process_instance: Uuid,
    pub workflow_status: ExecutionResult,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ─── Instance metadata ────────────────────────────────────────

pub const METADATA_VERSION: u32 = 1;

/// Progress markers kept across runs of the same instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataState {
    /// BPMN id of the flow object that was about to run last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flow_object: Option<String>,
}

/// Structured form of `ProcessInstance::metadata`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetadata {
    #[serde(default = "default_metadata_version")]
    pub version: u32,
    #[serde(default)]
    pub state: MetadataState,
    /// Keyed values set by running activities.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
}

fn default_metadata_version() -> u32 {
    METADATA_VERSION
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            state: MetadataState::default(),
            values: BTreeMap::new(),
        }
    }
}

impl InstanceMetadata {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed instance metadata");
                Self::default()
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.values.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_codes_round_trip() {
        for code in 1..=8 {
            let result = ExecutionResult::try_from(code).unwrap();
            assert_eq!(result.code(), code);
        }
        assert!(ExecutionResult::try_from(0).is_err());
        assert!(ExecutionState::try_from(8).is_err());
    }

    #[test]
    fn metadata_uses_last_flow_object_key() {
        let mut meta = InstanceMetadata::default();
        meta.state.last_flow_object = Some("Task_1".to_string());
        meta.set("attempt", json!(2));

        let raw = serde_json::to_value(&meta).unwrap();
        assert_eq!(raw["state"]["lastFlowObject"], json!("Task_1"));
        assert_eq!(raw["version"], json!(METADATA_VERSION));
        assert_eq!(raw["values"]["attempt"], json!(2));
    }

    #[test]
    fn malformed_metadata_reads_as_default() {
        let mut instance = ProcessInstance::new(Uuid::now_v7());
        instance.metadata = Some("{not json".to_string());
        assert_eq!(instance.read_metadata(), InstanceMetadata::default());

        instance.metadata = Some(r#"{"state":{"lastFlowObject":"StartEvent_1"}}"#.to_string());
        let meta = instance.read_metadata();
        assert_eq!(meta.version, METADATA_VERSION);
        assert_eq!(meta.state.last_flow_object.as_deref(), Some("StartEvent_1"));
    }

    #[test]
    fn base_type_detection() {
        let instance = ProcessInstance::new(Uuid::now_v7());
        assert!(instance.is_base_type());
        assert!(!instance.with_additional_type("OrderProcess").is_base_type());
    }
}
