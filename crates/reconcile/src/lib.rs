//! Reconciliation entry point: trigger processing, baseline decode, decision,
//! rollout creation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use rollgate_core::{DeploymentCause, EngineError, EngineResult, WorkloadConfig, WorkloadId};
use rollgate_resolve::ImageStreamStore;
use rollgate_trigger::{can_trigger, process_triggers};

/// Last rollout actually created for a workload, as persisted by the rollout
/// store. Carries the desired config it was created from as an encoded
/// snapshot, so the change detector has a baseline to compare against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealizedRollout {
    pub name: String,
    pub version: u64,
    pub created_ts: i64,
    pub encoded_config: String,
}

/// Decode the config snapshot a rollout was created from.
pub fn decode_config(rollout: &RealizedRollout) -> EngineResult<WorkloadConfig> {
    serde_json::from_str(&rollout.encoded_config)
        .map_err(|e| EngineError::Decode(format!("rollout {}: {}", rollout.name, e)))
}

/// Encode a config snapshot for storage on a rollout.
pub fn encode_config(config: &WorkloadConfig) -> EngineResult<String> {
    serde_json::to_string(config).map_err(|e| EngineError::Internal(e.to_string()))
}

/// Read side of the rollout store.
#[async_trait]
pub trait RolloutStore: Send + Sync {
    /// Most recent rollout for the workload, if any was ever created.
    async fn latest(&self, id: &WorkloadId) -> EngineResult<Option<RealizedRollout>>;
}

/// Rollout materialization, owned by the surrounding control plane. Guarding
/// against duplicate creation under concurrent passes over the same identity
/// (e.g. optimistic concurrency on the version) lives behind this trait, not
/// in the engine.
#[async_trait]
pub trait RolloutCreator: Send + Sync {
    async fn create(
        &self,
        config: &WorkloadConfig,
        causes: &[DeploymentCause],
    ) -> EngineResult<RealizedRollout>;
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Post-processing desired config; the version is bumped when a rollout
    /// was created.
    pub config: WorkloadConfig,
    pub deployed: bool,
    pub causes: Vec<DeploymentCause>,
    pub rollout: Option<RealizedRollout>,
}

/// Composes the trigger processor and the change detector over the external
/// collaborators.
pub struct Reconciler {
    streams: Arc<dyn ImageStreamStore>,
    rollouts: Arc<dyn RolloutStore>,
    creator: Arc<dyn RolloutCreator>,
}

impl Reconciler {
    pub fn new(
        streams: Arc<dyn ImageStreamStore>,
        rollouts: Arc<dyn RolloutStore>,
        creator: Arc<dyn RolloutCreator>,
    ) -> Self {
        Self { streams, rollouts, creator }
    }

    /// Run one reconciliation pass over `config`. Creates at most one
    /// rollout; repeated passes over unchanged inputs are no-ops. Errors from
    /// collaborators surface unchanged and nothing is created.
    pub async fn reconcile(&self, config: WorkloadConfig, force: bool) -> EngineResult<ReconcileOutcome> {
        counter!("reconcile_attempts", 1u64);
        let config = process_triggers(self.streams.as_ref(), config, force).await?;

        let decoded = match config.version {
            0 => None,
            _ => match self.rollouts.latest(&config.id).await? {
                Some(rollout) => Some(decode_config(&rollout)?),
                // Missing baseline: treated like an initial deployment.
                None => None,
            },
        };

        let (deploy, causes) = match can_trigger(&config, decoded.as_ref(), force) {
            Ok(decision) => decision,
            Err(e) => {
                if matches!(e, EngineError::Conflict(_)) {
                    counter!("reconcile_conflicts", 1u64);
                }
                return Err(e);
            }
        };

        if !deploy {
            counter!("reconcile_noops", 1u64);
            debug!(workload = %config.id, "nothing to deploy");
            return Ok(ReconcileOutcome { config, deployed: false, causes: Vec::new(), rollout: None });
        }

        let mut next = config;
        next.version += 1;
        let rollout = self.creator.create(&next, &causes).await?;
        counter!("rollouts_created", 1u64);
        info!(workload = %next.id, version = next.version, rollout = %rollout.name, "rollout created");
        Ok(ReconcileOutcome { config: next, deployed: true, causes, rollout: Some(rollout) })
    }
}

struct StoredRollout {
    rollout: RealizedRollout,
    causes: Vec<DeploymentCause>,
}

/// In-memory rollout store for tests and embedders. Implements both the read
/// and the creation contracts; rejects a duplicate version for the same
/// identity the way a persistent store with optimistic concurrency would.
#[derive(Default)]
pub struct MemoryRolloutStore {
    inner: Mutex<FxHashMap<WorkloadId, Vec<StoredRollout>>>,
}

impl MemoryRolloutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rollouts created for the workload.
    pub async fn count(&self, id: &WorkloadId) -> usize {
        self.inner.lock().await.get(id).map_or(0, |v| v.len())
    }

    /// Causes recorded with a created rollout, for inspection in tests.
    pub async fn recorded_causes(&self, id: &WorkloadId, version: u64) -> Option<Vec<DeploymentCause>> {
        self.inner
            .lock()
            .await
            .get(id)
            .and_then(|v| v.iter().find(|s| s.rollout.version == version))
            .map(|s| s.causes.clone())
    }
}

#[async_trait]
impl RolloutStore for MemoryRolloutStore {
    async fn latest(&self, id: &WorkloadId) -> EngineResult<Option<RealizedRollout>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(id)
            .and_then(|v| v.iter().max_by_key(|s| s.rollout.version))
            .map(|s| s.rollout.clone()))
    }
}

#[async_trait]
impl RolloutCreator for MemoryRolloutStore {
    async fn create(
        &self,
        config: &WorkloadConfig,
        causes: &[DeploymentCause],
    ) -> EngineResult<RealizedRollout> {
        let rollout = RealizedRollout {
            name: format!("{}-{}", config.id.name, config.version),
            version: config.version,
            created_ts: chrono::Utc::now().timestamp(),
            encoded_config: encode_config(config)?,
        };
        let mut inner = self.inner.lock().await;
        let entries = inner.entry(config.id.clone()).or_default();
        if entries.iter().any(|s| s.rollout.version == config.version) {
            return Err(EngineError::Conflict(format!("rollout {} already exists", rollout.name)));
        }
        entries.push(StoredRollout { rollout: rollout.clone(), causes: causes.to_vec() });
        Ok(rollout)
    }
}
