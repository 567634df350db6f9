//! Target resolution (spec §4.4).

use deploy_core::model::Instance;
use deploy_core::store::Store;
use deploy_core::{Error, ResourceId, Result};
use std::collections::HashMap;

/// Resolve the effective target instance list for a deployment request.
///
/// If `target_instances` is non-empty, every referenced Instance must
/// exist; the list is returned unchanged (order preserved, duplicates
/// not removed — the caller's responsibility, per the open question in
/// the design notes).
///
/// Otherwise, every Instance matching `target_labels` under AND
/// semantics is returned. An empty/nil selector matches every
/// Instance. An Instance with no labels only matches the empty
/// selector.
pub async fn resolve_targets(
    store: &dyn Store,
    target_instances: &[ResourceId],
    target_labels: Option<&HashMap<String, String>>,
) -> Result<Vec<ResourceId>> {
    if !target_instances.is_empty() {
        for id in target_instances {
            store.get_instance(*id).await.map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("instance {id}")),
                other => other,
            })?;
        }
        return Ok(target_instances.to_vec());
    }

    let instances = store.list_instances(None).await?;
    let selector = target_labels.cloned().unwrap_or_default();
    Ok(instances
        .into_iter()
        .filter(|instance| matches_selector(instance, &selector))
        .map(|instance| instance.id)
        .collect())
}

fn matches_selector(instance: &Instance, selector: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| instance.labels.get(k).is_some_and(|lv| lv == v))
}
