//! Image tag resolution against an external stream store.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use rollgate_core::{EngineError, EngineResult, ImageStream};

/// Read side of the image registry abstraction.
#[async_trait]
pub trait ImageStreamStore: Send + Sync {
    /// Fetch a stream by identity. `Ok(None)` when the stream does not exist;
    /// errors are reserved for transport failures.
    async fn get(&self, namespace: &str, name: &str) -> EngineResult<Option<ImageStream>>;
}

/// Freshly resolved image for a stream tag: content locator plus stable ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub image_ref: String,
    pub image_id: String,
}

/// Resolve the most recent image for `tag` on `namespace/stream`.
///
/// Absence (of the stream or of the tag) comes back as `Ok(None)`: a trigger
/// naming a stream that is not there yet simply cannot fire. Every call hits
/// the store; staleness is bounded by how often the caller reconciles, not by
/// any caching here.
pub async fn resolve_tag(
    store: &dyn ImageStreamStore,
    namespace: &str,
    stream: &str,
    tag: &str,
) -> EngineResult<Option<ResolvedImage>> {
    let Some(found) = store.get(namespace, stream).await? else {
        debug!(namespace, stream, "image stream not found");
        return Ok(None);
    };
    match found.latest_event(tag) {
        Some(ev) => Ok(Some(ResolvedImage {
            image_ref: ev.image_ref.clone(),
            image_id: ev.image_id.clone(),
        })),
        None => {
            debug!(namespace, stream, tag, "tag has no resolved history");
            Ok(None)
        }
    }
}

/// In-memory stream store for tests and embedders.
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: Mutex<FxHashMap<(String, String), ImageStream>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, stream: ImageStream) {
        self.streams
            .lock()
            .await
            .insert((stream.namespace.clone(), stream.name.clone()), stream);
    }
}

#[async_trait]
impl ImageStreamStore for MemoryStreamStore {
    async fn get(&self, namespace: &str, name: &str) -> EngineResult<Option<ImageStream>> {
        let streams = self.streams.lock().await;
        Ok(streams.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

/// Store that fails every lookup; exercises transport error paths.
pub struct FailingStreamStore(pub String);

#[async_trait]
impl ImageStreamStore for FailingStreamStore {
    async fn get(&self, _namespace: &str, _name: &str) -> EngineResult<Option<ImageStream>> {
        Err(EngineError::Transport(self.0.clone()))
    }
}
