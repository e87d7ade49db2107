//! Maps store change events to the chart deployments they affect.

use chartfleet_state::{
    ChartDeployment, Cluster, ClusterRelease, ObjectKey, Resource, ResourceStore, Selector,
    WatchEvent,
};
use tracing::warn;

use crate::error::ControllerResult;

/// Deployments that need a pass because of `event`.
///
/// A cluster event wakes every deployment in the cluster's namespace whose
/// selector matches the cluster's labels, plus every deployment that
/// selected the cluster on its last pass so that deselection is noticed.
pub async fn deployments_for_event<S: ResourceStore>(
    store: &S,
    event: &WatchEvent,
) -> ControllerResult<Vec<ObjectKey>> {
    if event.kind == ChartDeployment::KIND {
        return Ok(vec![event.key.clone()]);
    }

    if event.kind == ClusterRelease::KIND {
        let owner = event
            .owner_references
            .iter()
            .find(|r| r.controller && r.kind == ChartDeployment::KIND);
        return Ok(owner
            .map(|r| ObjectKey::new(&event.key.namespace, &r.name))
            .into_iter()
            .collect());
    }

    if event.kind != Cluster::KIND {
        return Ok(Vec::new());
    }

    let deployments: Vec<ChartDeployment> = store
        .list(Some(&event.key.namespace), &Selector::everything())
        .await?;
    let mut keys = Vec::new();
    for deployment in deployments {
        let selected_before = deployment.status.matching_clusters.contains(&event.key);
        let selects_now = match deployment.spec.cluster_selector.to_selector() {
            Ok(selector) => selector.matches(&event.labels),
            Err(e) => {
                warn!(deployment = %deployment.metadata.key(), error = %e, "invalid cluster selector");
                false
            }
        };
        if selected_before || selects_now {
            keys.push(deployment.metadata.key());
        }
    }
    Ok(keys)
}
