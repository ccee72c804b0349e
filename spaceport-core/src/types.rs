//! Fundamental types shared by the resolver, the submission engine and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Generic message for transport failures.
pub const BROKEN_CONNECTION_MSG: &str = "Connection errored out.";

/// Message used when the server rejects a job for capacity reasons.
pub const QUEUE_FULL_MSG: &str = "This application is too busy. Keep trying!";

/// Treat an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `api_name` may be a string, `null`, or `false`; only strings name an endpoint.
fn api_name<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(name) => Ok(Some(name)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Configuration document declared by the remote app (`GET /config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base path the app is mounted under.
    #[serde(default, deserialize_with = "null_as_default")]
    pub path: String,
    /// Origin URL of the app.
    #[serde(default, deserialize_with = "null_as_default")]
    pub root: String,
    /// Whether endpoints are queued unless they say otherwise.
    #[serde(default, deserialize_with = "null_as_default")]
    pub enable_queue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// One record per endpoint, indexed by `fn_index`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub dependencies: Vec<Dependency>,
    /// Everything else the server declares, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-endpoint record in [`AppConfig::dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default, deserialize_with = "api_name")]
    pub api_name: Option<String>,
    /// Tri-state queue override; `None` falls back to `enable_queue`.
    #[serde(default)]
    pub queue: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppConfig {
    /// Whether submissions to `fn_index` bypass the queue.
    pub fn skip_queue(&self, fn_index: usize) -> bool {
        let queued = self
            .dependencies
            .get(fn_index)
            .and_then(|dep| dep.queue)
            .unwrap_or(self.enable_queue);
        !queued
    }

    /// Build the endpoint name -> `fn_index` table.
    pub fn api_map(&self) -> HashMap<String, usize> {
        self.dependencies
            .iter()
            .enumerate()
            .filter_map(|(i, dep)| dep.api_name.as_ref().map(|name| (name.clone(), i)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Endpoints and payloads
// ---------------------------------------------------------------------------

/// Identifies a callable endpoint either by name or by numeric index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointRef {
    Name(String),
    Index(usize),
}

impl EndpointRef {
    /// Name with the leading slash removed, as used in the name table.
    pub fn trimmed_name(&self) -> Option<&str> {
        match self {
            EndpointRef::Name(name) => Some(name.trim().trim_start_matches('/')),
            EndpointRef::Index(_) => None,
        }
    }

    /// Route used by the direct run endpoint. Numeric endpoints run as `/predict`.
    pub fn route(&self) -> String {
        match self {
            EndpointRef::Name(_) => format!("/{}", self.trimmed_name().unwrap_or_default()),
            EndpointRef::Index(_) => "/predict".to_string(),
        }
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::Name(name) => write!(f, "{name}"),
            EndpointRef::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        EndpointRef::Name(name.to_string())
    }
}

impl From<String> for EndpointRef {
    fn from(name: String) -> Self {
        EndpointRef::Name(name)
    }
}

impl From<usize> for EndpointRef {
    fn from(index: usize) -> Self {
        EndpointRef::Index(index)
    }
}

/// Body of a single job once all binary leaves have been replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<Value>,
    pub event_data: Value,
    pub fn_index: usize,
}

impl Payload {
    /// Wire form with the session id attached.
    pub fn with_session(&self, session_hash: &str) -> Value {
        serde_json::json!({
            "data": self.data,
            "event_data": self.event_data,
            "fn_index": self.fn_index,
            "session_hash": session_hash,
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle stage of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Generating,
    Complete,
    Error,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pending => write!(f, "pending"),
            Stage::Generating => write!(f, "generating"),
            Stage::Complete => write!(f, "complete"),
            Stage::Error => write!(f, "error"),
        }
    }
}

/// Classification of an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Transport or network failure.
    Connection,
    /// Non-success response or server-reported failure.
    Server,
    /// Capacity rejection from the queue.
    QueueFull,
}

/// One unit of server-reported progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUnit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

/// Body of a `status` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub stage: Stage,
    /// Whether the submission went through the queue.
    pub queue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    /// Queue size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Position in the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    /// Estimated seconds remaining (or average duration once complete).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_data: Option<Vec<ProgressUnit>>,
    /// Set when the update was caused by a broken connection.
    #[serde(default)]
    pub broken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl StatusUpdate {
    pub fn new(stage: Stage, queue: bool) -> Self {
        Self {
            stage,
            queue,
            message: None,
            code: None,
            size: None,
            position: None,
            eta: None,
            success: None,
            progress_data: None,
            broken: false,
            fault: None,
        }
    }

    /// An error update with the given classification and message.
    pub fn error(fault: Fault, message: impl Into<String>, queue: bool) -> Self {
        Self {
            message: Some(message.into()),
            fault: Some(fault),
            ..Self::new(Stage::Error, queue)
        }
    }

    /// A terminal error caused by a dropped or failed connection.
    pub fn broken_connection(queue: bool) -> Self {
        Self {
            broken: true,
            ..Self::error(Fault::Connection, BROKEN_CONNECTION_MSG, queue)
        }
    }
}

/// Event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Data,
}

/// What an event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventBody {
    Status(StatusUpdate),
    Data { data: Value },
}

/// An event addressed to one endpoint/fn_index pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn status(endpoint: impl Into<String>, fn_index: usize, update: StatusUpdate) -> Self {
        Self {
            endpoint: endpoint.into(),
            fn_index,
            time: Utc::now(),
            body: EventBody::Status(update),
        }
    }

    pub fn data(endpoint: impl Into<String>, fn_index: usize, data: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            fn_index,
            time: Utc::now(),
            body: EventBody::Data { data },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Status(_) => EventKind::Status,
            EventBody::Data { .. } => EventKind::Data,
        }
    }

    /// The status update, if this is a status event.
    pub fn as_status(&self) -> Option<&StatusUpdate> {
        match &self.body {
            EventBody::Status(update) => Some(update),
            EventBody::Data { .. } => None,
        }
    }

    /// The output payload, if this is a data event.
    pub fn as_data(&self) -> Option<&Value> {
        match &self.body {
            EventBody::Data { data } => Some(data),
            EventBody::Status(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Space wake-up status
// ---------------------------------------------------------------------------

/// Runtime stage reported by the hub for a hosted space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceStage {
    Stopped,
    Sleeping,
    Building,
    Running,
    RunningBuilding,
    Other(String),
}

impl SpaceStage {
    pub fn parse(stage: &str) -> Self {
        match stage {
            "STOPPED" => SpaceStage::Stopped,
            "SLEEPING" => SpaceStage::Sleeping,
            "BUILDING" => SpaceStage::Building,
            "RUNNING" => SpaceStage::Running,
            "RUNNING_BUILDING" => SpaceStage::RunningBuilding,
            other => SpaceStage::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SpaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceStage::Stopped => write!(f, "STOPPED"),
            SpaceStage::Sleeping => write!(f, "SLEEPING"),
            SpaceStage::Building => write!(f, "BUILDING"),
            SpaceStage::Running => write!(f, "RUNNING"),
            SpaceStage::RunningBuilding => write!(f, "RUNNING_BUILDING"),
            SpaceStage::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Coarse state reported to the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceState {
    Sleeping,
    Building,
    Running,
    SpaceError,
    Error,
}

/// Whether loading is still in progress, done, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Pending,
    Complete,
    Error,
}

/// Payload delivered to the resolution status callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceStatus {
    pub status: SpaceState,
    pub load_status: LoadStatus,
    pub message: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discussions_enabled: Option<bool>,
}
