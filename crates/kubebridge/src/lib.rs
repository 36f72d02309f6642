//! Kube-backed collaborator stores.
//!
//! Image streams live as namespaced dynamic objects whose `status.tags` holds
//! the per-tag event history; realized rollouts are ReplicationControllers
//! labeled with the owning workload and annotated with the encoded desired
//! config, one controller per version.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar as KubeEnvVar, PodSpec, PodTemplateSpec, ReplicationController,
    ReplicationControllerSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::{debug, warn};

use rollgate_core::{
    DeploymentCause, EngineError, EngineResult, ImageStream, TagEvent, WorkloadConfig, WorkloadId,
};
use rollgate_reconcile::{encode_config, RealizedRollout, RolloutCreator, RolloutStore};
use rollgate_resolve::ImageStreamStore;

const ENCODED_CONFIG_ANNOTATION: &str = "rollgate.io/encoded-config";
const VERSION_ANNOTATION: &str = "rollgate.io/version";
const CAUSES_ANNOTATION: &str = "rollgate.io/causes";
const WORKLOAD_LABEL: &str = "rollgate.io/workload";

fn transport(e: kube::Error) -> EngineError {
    EngineError::Transport(e.to_string())
}

/// Stream store reading CRD-shaped image stream objects.
pub struct KubeStreamStore {
    client: Client,
    resource: ApiResource,
}

impl KubeStreamStore {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind {
            group: "rollgate.io".into(),
            version: "v1alpha1".into(),
            kind: "ImageStream".into(),
        };
        Self::with_gvk(client, &gvk)
    }

    /// Read streams served under a different group/version/kind.
    pub fn with_gvk(client: Client, gvk: &GroupVersionKind) -> Self {
        Self { client, resource: ApiResource::from_gvk(gvk) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl ImageStreamStore for KubeStreamStore {
    async fn get(&self, namespace: &str, name: &str) -> EngineResult<Option<ImageStream>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.resource);
        let Some(obj) = api.get_opt(name).await.map_err(transport)? else {
            debug!(namespace, name, "image stream not served");
            return Ok(None);
        };
        let raw = serde_json::to_value(&obj).map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(Some(stream_from_object(namespace, name, &raw)))
    }
}

/// Shape a raw stream object into the engine's read model. Malformed tag
/// entries are skipped rather than failing the whole stream.
fn stream_from_object(namespace: &str, name: &str, raw: &serde_json::Value) -> ImageStream {
    let mut stream =
        ImageStream { namespace: namespace.into(), name: name.into(), ..Default::default() };
    let Some(tags) = raw.get("status").and_then(|s| s.get("tags")).and_then(|t| t.as_object())
    else {
        return stream;
    };
    for (tag, entry) in tags {
        let Some(items) = entry.get("items").and_then(|i| i.as_array()) else { continue };
        let history: Vec<TagEvent> = items
            .iter()
            .filter_map(|item| {
                let image_ref = item.get("imageReference")?.as_str()?;
                let image_id = item.get("imageID").and_then(|v| v.as_str()).unwrap_or_default();
                Some(TagEvent { image_ref: image_ref.into(), image_id: image_id.into() })
            })
            .collect();
        stream.tags.insert(tag.clone(), history);
    }
    stream
}

/// Rollout store and creator over ReplicationControllers.
pub struct KubeRolloutStore {
    client: Client,
}

impl KubeRolloutStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl RolloutStore for KubeRolloutStore {
    async fn latest(&self, id: &WorkloadId) -> EngineResult<Option<RealizedRollout>> {
        let api: Api<ReplicationController> =
            Api::namespaced(self.client.clone(), &id.namespace);
        let lp = ListParams::default().labels(&format!("{WORKLOAD_LABEL}={}", id.name));
        let list = api.list(&lp).await.map_err(transport)?;

        let mut best: Option<RealizedRollout> = None;
        for rc in list.items {
            match rollout_from_controller(&rc) {
                Some(r) => {
                    if best.as_ref().map_or(true, |b| r.version > b.version) {
                        best = Some(r);
                    }
                }
                None => warn!(
                    name = rc.metadata.name.as_deref().unwrap_or(""),
                    "controller without rollout annotations; skipping"
                ),
            }
        }
        Ok(best)
    }
}

#[async_trait]
impl RolloutCreator for KubeRolloutStore {
    async fn create(
        &self,
        config: &WorkloadConfig,
        causes: &[DeploymentCause],
    ) -> EngineResult<RealizedRollout> {
        let rc = controller_for_config(config, causes)?;
        let api: Api<ReplicationController> =
            Api::namespaced(self.client.clone(), &config.id.namespace);
        let created = api.create(&PostParams::default(), &rc).await.map_err(transport)?;
        rollout_from_controller(&created).ok_or_else(|| {
            EngineError::Internal("created controller lost its rollout annotations".into())
        })
    }
}

/// Read the rollout view off a controller; `None` when the annotations that
/// make it a rollout are missing.
fn rollout_from_controller(rc: &ReplicationController) -> Option<RealizedRollout> {
    let name = rc.metadata.name.clone()?;
    let annotations = rc.metadata.annotations.as_ref()?;
    let version = annotations.get(VERSION_ANNOTATION)?.parse().ok()?;
    let encoded_config = annotations.get(ENCODED_CONFIG_ANNOTATION)?.clone();
    let created_ts =
        rc.metadata.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
    Some(RealizedRollout { name, version, created_ts, encoded_config })
}

/// Materialize the controller for a desired config at its current version.
fn controller_for_config(
    config: &WorkloadConfig,
    causes: &[DeploymentCause],
) -> EngineResult<ReplicationController> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ENCODED_CONFIG_ANNOTATION.to_string(), encode_config(config)?);
    annotations.insert(VERSION_ANNOTATION.to_string(), config.version.to_string());
    annotations.insert(
        CAUSES_ANNOTATION.to_string(),
        serde_json::to_string(causes).map_err(|e| EngineError::Internal(e.to_string()))?,
    );

    let mut labels = BTreeMap::new();
    labels.insert(WORKLOAD_LABEL.to_string(), config.id.name.clone());
    for (k, v) in config.template.labels.iter() {
        labels.insert(k.clone(), v.clone());
    }

    let containers = config
        .template
        .containers
        .iter()
        .map(|c| Container {
            name: c.name.clone(),
            image: Some(c.image.clone()),
            env: if c.env.is_empty() {
                None
            } else {
                Some(
                    c.env
                        .iter()
                        .map(|e| KubeEnvVar {
                            name: e.name.clone(),
                            value: Some(e.value.clone()),
                            ..Default::default()
                        })
                        .collect(),
                )
            },
            ..Default::default()
        })
        .collect();

    Ok(ReplicationController {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", config.id.name, config.version)),
            namespace: Some(config.id.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: Some(config.replicas as i32),
            selector: Some(labels.clone()),
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec { containers, ..Default::default() }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}
