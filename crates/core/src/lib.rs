//! Rollgate core types and errors

#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identity of a workload configuration inside the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Desired pod template. `PartialEq` is the field-wise structural comparison
/// the change detector relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodTemplate {
    /// Pod labels as key/value pairs.
    #[serde(default)]
    pub labels: SmallVec<[(String, String); 4]>,
    pub containers: Vec<ContainerSpec>,
}

impl PodTemplate {
    /// Image currently set on the named container, if present.
    pub fn container_image(&self, name: &str) -> Option<&str> {
        self.containers.iter().find(|c| c.name == name).map(|c| c.image.as_str())
    }
}

/// Reference to an upstream image stream tag. A missing namespace means
/// "same namespace as the workload".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamTagRef {
    #[serde(default)]
    pub namespace: Option<String>,
    pub stream: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageChangeParams {
    pub automatic: bool,
    /// Containers in the template this trigger owns.
    pub container_names: SmallVec<[String; 2]>,
    pub from: StreamTagRef,
    /// Most recent resolution applied by the trigger processor. `None` means
    /// the trigger has never fired; once set it only ever advances.
    #[serde(default)]
    pub last_triggered_image: Option<String>,
}

/// Declared condition under which a new rollout is created automatically.
/// List order on the workload is significant: causes are reported in policy
/// order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "params", rename_all = "kebab-case")]
pub enum TriggerPolicy {
    Manual,
    ConfigChange,
    ImageChange(ImageChangeParams),
}

/// Desired state of a workload, as handed to the engine by the control-plane
/// store. The engine works on its own copy and never persists it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub id: WorkloadId,
    /// Rollout counter; 0 = never deployed.
    pub version: u64,
    pub replicas: u32,
    pub triggers: Vec<TriggerPolicy>,
    pub template: PodTemplate,
}

/// One resolved image event in a tag history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagEvent {
    pub image_ref: String,
    pub image_id: String,
}

/// External registry stream; read-only to the engine. Tag histories are
/// ordered most recent first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageStream {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, Vec<TagEvent>>,
}

impl ImageStream {
    /// Most recent event for `tag`, if the stream carries it.
    pub fn latest_event(&self, tag: &str) -> Option<&TagEvent> {
        self.tags.get(tag).and_then(|history| history.first())
    }
}

/// Audit record explaining why a rollout was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "image_trigger", rename_all = "kebab-case")]
pub enum DeploymentCause {
    Manual,
    ConfigChange,
    ImageChange { from: StreamTagRef, image: String },
}

/// Engine errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum EngineError {
    /// A collaborator failed for reasons other than the entity not existing.
    #[error("transport: {0}")]
    Transport(String),
    /// Trigger bookkeeping and the template disagree; no decision is guessed.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
