#![forbid(unsafe_code)]

use std::sync::Arc;

use rollgate_core::{
    ContainerSpec, DeploymentCause, EngineError, ImageChangeParams, ImageStream, PodTemplate,
    StreamTagRef, TagEvent, TriggerPolicy, WorkloadConfig, WorkloadId,
};
use rollgate_reconcile::{MemoryRolloutStore, Reconciler, RolloutCreator};
use rollgate_resolve::{FailingStreamStore, MemoryStreamStore};

const STREAM: &str = "app-stream";
const TAG: &str = "latest";
const IMAGE_V1: &str = "registry:8080/app@sha256:aaa";
const IMAGE_V2: &str = "registry:8080/app@sha256:bbb";

fn workload(triggers: Vec<TriggerPolicy>) -> WorkloadConfig {
    WorkloadConfig {
        id: WorkloadId::new("default", "web"),
        version: 0,
        replicas: 2,
        triggers,
        template: PodTemplate {
            labels: Default::default(),
            containers: vec![ContainerSpec {
                name: "app".into(),
                image: "registry:8080/app:edge".into(),
                env: Vec::new(),
            }],
        },
    }
}

fn auto_ict() -> TriggerPolicy {
    TriggerPolicy::ImageChange(ImageChangeParams {
        automatic: true,
        container_names: smallvec::smallvec!["app".to_string()],
        from: StreamTagRef { namespace: None, stream: STREAM.into(), tag: TAG.into() },
        last_triggered_image: None,
    })
}

async fn stream_store_resolving(image: &str) -> Arc<MemoryStreamStore> {
    let store = Arc::new(MemoryStreamStore::new());
    push_event(&store, image).await;
    store
}

async fn push_event(store: &MemoryStreamStore, image: &str) {
    let mut stream =
        ImageStream { namespace: "default".into(), name: STREAM.into(), ..Default::default() };
    stream.tags.insert(
        TAG.into(),
        vec![TagEvent { image_ref: image.into(), image_id: image.rsplit('@').next().unwrap_or("").into() }],
    );
    store.put(stream).await;
}

fn reconciler(streams: Arc<MemoryStreamStore>, rollouts: Arc<MemoryRolloutStore>) -> Reconciler {
    Reconciler::new(streams, rollouts.clone(), rollouts)
}

#[tokio::test]
async fn initial_config_change_creates_the_first_rollout() {
    let streams = Arc::new(MemoryStreamStore::new());
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = reconciler(streams, rollouts.clone());

    let outcome = engine.reconcile(workload(vec![TriggerPolicy::ConfigChange]), false).await.unwrap();
    assert!(outcome.deployed);
    assert_eq!(outcome.causes, vec![DeploymentCause::ConfigChange]);
    assert_eq!(outcome.config.version, 1);

    let rollout = outcome.rollout.unwrap();
    assert_eq!(rollout.name, "web-1");
    let id = WorkloadId::new("default", "web");
    assert_eq!(rollouts.recorded_causes(&id, 1).await, Some(vec![DeploymentCause::ConfigChange]));
}

#[tokio::test]
async fn repeated_passes_do_not_duplicate_rollouts() {
    let streams = Arc::new(MemoryStreamStore::new());
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = reconciler(streams, rollouts.clone());

    let outcome = engine.reconcile(workload(vec![TriggerPolicy::ConfigChange]), false).await.unwrap();
    let id = outcome.config.id.clone();

    let second = engine.reconcile(outcome.config, false).await.unwrap();
    assert!(!second.deployed);
    assert!(second.rollout.is_none());
    assert_eq!(rollouts.count(&id).await, 1);
}

#[tokio::test]
async fn image_advance_creates_the_next_rollout() {
    let streams = stream_store_resolving(IMAGE_V1).await;
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = reconciler(streams.clone(), rollouts.clone());

    // Initial pass: the processor resolves the trigger, the detector fires on
    // the initial image change.
    let first = engine.reconcile(workload(vec![auto_ict()]), false).await.unwrap();
    assert!(first.deployed);
    assert_eq!(first.config.version, 1);
    assert_eq!(first.config.template.container_image("app"), Some(IMAGE_V1));
    assert_eq!(
        first.causes,
        vec![DeploymentCause::ImageChange {
            from: StreamTagRef { namespace: None, stream: STREAM.into(), tag: TAG.into() },
            image: IMAGE_V1.into(),
        }]
    );

    // Steady state: nothing new upstream, nothing to deploy.
    let steady = engine.reconcile(first.config, false).await.unwrap();
    assert!(!steady.deployed);

    // The stream advances; the next pass rolls out the new image.
    push_event(&streams, IMAGE_V2).await;
    let second = engine.reconcile(steady.config, false).await.unwrap();
    assert!(second.deployed);
    assert_eq!(second.config.version, 2);
    assert_eq!(second.config.template.container_image("app"), Some(IMAGE_V2));
    assert_eq!(second.rollout.unwrap().name, "web-2");
}

#[tokio::test]
async fn forced_pass_records_a_manual_cause() {
    let streams = Arc::new(MemoryStreamStore::new());
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = reconciler(streams, rollouts.clone());

    let first = engine.reconcile(workload(vec![TriggerPolicy::ConfigChange]), false).await.unwrap();
    // Nothing changed, but the operator insists.
    let forced = engine.reconcile(first.config, true).await.unwrap();
    assert!(forced.deployed);
    assert_eq!(forced.causes, vec![DeploymentCause::Manual]);
    assert_eq!(forced.config.version, 2);
}

#[tokio::test]
async fn conflicts_block_rollout_creation() {
    let streams = Arc::new(MemoryStreamStore::new());
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = reconciler(streams, rollouts.clone());

    // Realize a baseline carrying a non-automatic, never-resolved trigger.
    let mut baseline = workload(vec![
        TriggerPolicy::ConfigChange,
        TriggerPolicy::ImageChange(ImageChangeParams {
            automatic: false,
            container_names: smallvec::smallvec!["app".to_string()],
            from: StreamTagRef { namespace: None, stream: STREAM.into(), tag: TAG.into() },
            last_triggered_image: None,
        }),
    ]);
    baseline.version = 1;
    baseline.template.containers[0].image = IMAGE_V1.into();
    rollouts.create(&baseline, &[DeploymentCause::ConfigChange]).await.unwrap();

    // Desired state moved the owned image by hand; the trigger never recorded
    // a resolution, so the move is unaccounted for.
    let mut desired = baseline;
    desired.template.containers[0].image = IMAGE_V2.into();

    let err = engine.reconcile(desired.clone(), false).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "got {err:?}");
    assert_eq!(rollouts.count(&desired.id).await, 1, "no rollout may be created on conflict");
}

#[tokio::test]
async fn transport_failures_surface_unchanged() {
    let rollouts = Arc::new(MemoryRolloutStore::new());
    let engine = Reconciler::new(
        Arc::new(FailingStreamStore("registry unreachable".into())),
        rollouts.clone(),
        rollouts.clone(),
    );

    let err = engine.reconcile(workload(vec![auto_ict()]), false).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)), "got {err:?}");
    assert_eq!(rollouts.count(&WorkloadId::new("default", "web")).await, 0);
}
