//! Trigger processing and rollout decision logic.
//!
//! `process_triggers` rewrites a desired config from the current registry
//! state; `can_trigger` compares the rewritten config against the last
//! realized snapshot and decides whether a new rollout is warranted, with an
//! ordered, auditable cause list.

#![forbid(unsafe_code)]

use tracing::{debug, info};

use rollgate_core::{
    DeploymentCause, EngineError, EngineResult, ImageChangeParams, PodTemplate, StreamTagRef,
    TriggerPolicy, WorkloadConfig,
};
use rollgate_resolve::{resolve_tag, ImageStreamStore};

/// Walk the config's image-change policies once, resolving each against the
/// stream store and rewriting the owned containers. Consumes the config and
/// returns the rewritten value, so no caller can hold on to a half-mutated
/// alias while the change detector runs.
///
/// Per policy:
/// - skipped unless `automatic` or `force`;
/// - a stream or tag that does not exist yet is a no-op, not an error;
/// - an already-applied resolution is a no-op unless forced (a forced pass
///   always re-applies the currently resolved image);
/// - otherwise every owned container is re-pointed and
///   `last_triggered_image` advances.
///
/// Containers not owned by any trigger are never touched. Only transport
/// failures from the store surface as errors.
pub async fn process_triggers(
    store: &dyn ImageStreamStore,
    mut config: WorkloadConfig,
    force: bool,
) -> EngineResult<WorkloadConfig> {
    let default_ns = config.id.namespace.clone();
    let workload = config.id.name.clone();
    let WorkloadConfig { triggers, template, .. } = &mut config;

    for policy in triggers.iter_mut() {
        let TriggerPolicy::ImageChange(params) = policy else { continue };
        if !params.automatic && !force {
            continue;
        }

        let ns = params.from.namespace.as_deref().unwrap_or(&default_ns);
        let Some(resolved) = resolve_tag(store, ns, &params.from.stream, &params.from.tag).await?
        else {
            debug!(
                workload = %workload,
                stream = %params.from.stream,
                tag = %params.from.tag,
                "trigger cannot fire yet"
            );
            continue;
        };

        if !force && params.last_triggered_image.as_deref() == Some(resolved.image_ref.as_str()) {
            continue;
        }

        for container in template.containers.iter_mut() {
            if params.container_names.iter().any(|n| n == &container.name) {
                container.image = resolved.image_ref.clone();
            }
        }
        info!(workload = %workload, image = %resolved.image_ref, "image change trigger resolved");
        params.last_triggered_image = Some(resolved.image_ref);
    }

    Ok(config)
}

/// Decide whether a new rollout is warranted.
///
/// Pure over the two snapshots: `config` must be the post-processing desired
/// state, `decoded` the last realized one (`None` when nothing was ever
/// deployed). First matching rule wins:
///
/// 1. `force` deploys with a single `Manual` cause, unconditionally.
/// 2. An empty policy list never deploys; a bare template change is not
///    sufficient without a declared policy.
/// 3. Image-change policies are evaluated in list order and their causes
///    accumulate; any firing image-change suppresses a config-change cause
///    for the whole pass.
/// 4. A config-change policy fires on the initial deployment unconditionally,
///    otherwise iff the templates differ structurally.
///
/// An image that moved without its owning trigger recording the move is a
/// bookkeeping violation and aborts the pass with [`EngineError::Conflict`].
pub fn can_trigger(
    config: &WorkloadConfig,
    decoded: Option<&WorkloadConfig>,
    force: bool,
) -> EngineResult<(bool, Vec<DeploymentCause>)> {
    if force {
        return Ok((true, vec![DeploymentCause::Manual]));
    }
    if config.triggers.is_empty() {
        return Ok((false, Vec::new()));
    }

    let mut causes = Vec::new();
    let mut has_config_trigger = false;
    for policy in &config.triggers {
        match policy {
            TriggerPolicy::Manual => {}
            TriggerPolicy::ConfigChange => has_config_trigger = true,
            TriggerPolicy::ImageChange(params) => {
                if let Some(cause) = evaluate_image_change(config, decoded, params)? {
                    causes.push(cause);
                }
            }
        }
    }

    if !causes.is_empty() {
        return Ok((true, causes));
    }

    if has_config_trigger {
        let fires = match decoded {
            None => true, // initial deployment
            Some(dec) => config.template != dec.template,
        };
        if fires {
            debug!(workload = %config.id, "config change detected");
            return Ok((true, vec![DeploymentCause::ConfigChange]));
        }
    }

    Ok((false, Vec::new()))
}

/// Evaluate one image-change policy against the realized baseline. `Ok(None)`
/// means the policy contributes no cause this pass.
fn evaluate_image_change(
    config: &WorkloadConfig,
    decoded: Option<&WorkloadConfig>,
    params: &ImageChangeParams,
) -> EngineResult<Option<DeploymentCause>> {
    let Some(dec) = decoded else {
        // Initial deployment. An unresolved trigger means the template
        // carries images nothing accounts for, and the decision cannot be
        // attributed to any policy.
        let Some(last) = params.last_triggered_image.as_deref() else {
            return Err(EngineError::Conflict(format!(
                "workload {}: trigger on {}:{} has never resolved an image for its containers",
                config.id, params.from.stream, params.from.tag
            )));
        };
        if params.automatic {
            return Ok(Some(image_cause(params, last)));
        }
        return Ok(None);
    };

    let previous = decoded_trigger_image(dec, &params.from);
    match params.last_triggered_image.as_deref() {
        // The processor just advanced this trigger. Non-automatic policies
        // only deploy through the forced path, so they stay silent here.
        Some(last) if previous != Some(last) => {
            if params.automatic {
                Ok(Some(image_cause(params, last)))
            } else {
                Ok(None)
            }
        }
        _ => {
            if owned_images_diverge(params, &config.template, &dec.template) {
                Err(EngineError::Conflict(format!(
                    "workload {}: container image moved without trigger on {}:{} recording it",
                    config.id, params.from.stream, params.from.tag
                )))
            } else {
                Ok(None)
            }
        }
    }
}

/// `last_triggered_image` recorded on the decoded snapshot for the policy
/// pointing at `from`, if any.
fn decoded_trigger_image<'a>(decoded: &'a WorkloadConfig, from: &StreamTagRef) -> Option<&'a str> {
    decoded
        .triggers
        .iter()
        .find_map(|policy| match policy {
            TriggerPolicy::ImageChange(params) if params.from == *from => {
                Some(params.last_triggered_image.as_deref())
            }
            _ => None,
        })
        .flatten()
}

/// True when any container owned by `params` carries different images in the
/// two templates. Names missing from either template are malformed references
/// and contribute nothing.
fn owned_images_diverge(params: &ImageChangeParams, desired: &PodTemplate, realized: &PodTemplate) -> bool {
    params.container_names.iter().any(|name| {
        match (desired.container_image(name), realized.container_image(name)) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    })
}

fn image_cause(params: &ImageChangeParams, image: &str) -> DeploymentCause {
    DeploymentCause::ImageChange { from: params.from.clone(), image: image.to_string() }
}
