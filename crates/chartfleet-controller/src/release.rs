//! Per-cluster release materialization.
//!
//! Builds the desired [`ClusterRelease`] for one (deployment, cluster) pair
//! and makes the store match it.

use chartfleet_state::conditions::{self, Severity};
use chartfleet_state::{
    CLUSTER_NAME_LABEL, ChartDeployment, Cluster, ClusterRelease, ClusterReleaseSpec,
    ClusterReleaseStatus, DEPLOYMENT_GENERATION_LABEL, DEPLOYMENT_NAME_LABEL, Labels, ObjectKey,
    ObjectMeta, OwnerReference, ReconcileStrategy, Resource, ResourceStore, Selector, StateError,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::status::{SPECS_UP_TO_DATE, VALUE_PARSING_FAILED};
use crate::values;

/// Object names are limited to 63 characters.
const MAX_NAME_LEN: usize = 63;

/// Hex characters of the cluster hash appended to release names.
const HASH_LEN: usize = 5;

/// Name of the release of `deployment` on `cluster`:
/// `<deployment>-<cluster>-<hash>`, shortened to fit 63 characters.
pub fn release_name(deployment: &str, cluster: &ObjectKey) -> String {
    let digest = Sha256::digest(cluster.to_string().as_bytes());
    let hash = &hex::encode(digest)[..HASH_LEN];

    let base: String = format!("{deployment}-{}", cluster.name)
        .chars()
        .take(MAX_NAME_LEN - HASH_LEN - 1)
        .collect();
    format!("{}-{hash}", base.trim_end_matches(['-', '.']))
}

/// Labels every release of `deployment` on `cluster` carries.
fn release_labels(deployment: &ChartDeployment, cluster: &Cluster) -> Labels {
    Labels::from([
        (
            DEPLOYMENT_NAME_LABEL.to_string(),
            deployment.metadata.name.clone(),
        ),
        (CLUSTER_NAME_LABEL.to_string(), cluster.metadata.name.clone()),
        (
            DEPLOYMENT_GENERATION_LABEL.to_string(),
            deployment.metadata.generation.to_string(),
        ),
    ])
}

/// The release `deployment` wants on `cluster`, with `values` already rendered.
pub fn desired_release(deployment: &ChartDeployment, cluster: &Cluster, values: String) -> ClusterRelease {
    let cluster_key = cluster.metadata.key();
    let mut metadata = ObjectMeta::new(
        &deployment.metadata.namespace,
        release_name(&deployment.metadata.name, &cluster_key),
    );
    metadata.labels = release_labels(deployment, cluster);
    metadata.owner_references = vec![OwnerReference {
        kind: ChartDeployment::KIND.to_string(),
        name: deployment.metadata.name.clone(),
        controller: true,
    }];

    ClusterRelease {
        metadata,
        spec: ClusterReleaseSpec {
            cluster_ref: cluster_key,
            chart: deployment.spec.chart.clone(),
            release_name: deployment.release_name().to_string(),
            release_namespace: deployment.spec.release_namespace.clone(),
            values,
        },
        status: ClusterReleaseStatus::default(),
    }
}

/// What a release reconcile achieved for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The cluster's release matches the deployment's current generation.
    Applied,
    /// An earlier release is still being deleted; nothing exists for the
    /// current generation yet.
    Waiting,
}

/// Create or refresh the release of `deployment` on `cluster`.
///
/// A values template that fails to render marks `SpecsUpToDate` False on
/// the deployment before the error is returned.
pub async fn reconcile_for_cluster<S: ResourceStore>(
    store: &S,
    deployment: &mut ChartDeployment,
    cluster: &Cluster,
) -> ControllerResult<ReleaseOutcome> {
    let deployment_key = deployment.metadata.key();
    let values = match values::render(&deployment.spec.values_template, cluster) {
        Ok(v) => v,
        Err(e) => {
            conditions::mark_false(
                deployment,
                SPECS_UP_TO_DATE,
                VALUE_PARSING_FAILED,
                Severity::Error,
                e.to_string(),
            );
            return Err(e);
        }
    };
    let desired = desired_release(deployment, cluster, values);

    let existing = find_release(store, deployment, cluster).await?;
    let Some(existing) = existing else {
        let outcome = create_release(store, &desired).await?;
        if outcome == ReleaseOutcome::Applied {
            info!(
                deployment = %deployment_key,
                cluster = %cluster.metadata.key(),
                release = %desired.metadata.name,
                "release created"
            );
        }
        return Ok(outcome);
    };

    if existing.metadata.is_deleting() {
        debug!(
            deployment = %deployment_key,
            release = %existing.metadata.name,
            "release still deleting; waiting"
        );
        return Ok(ReleaseOutcome::Waiting);
    }

    // The installer cannot move a release, so a new name or namespace means
    // a fresh release.
    if existing.spec.release_name != desired.spec.release_name
        || existing.spec.release_namespace != desired.spec.release_namespace
    {
        match store.delete::<ClusterRelease>(&existing.metadata.key()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            deployment = %deployment_key,
            release = %existing.metadata.name,
            "release name or namespace changed; replacing"
        );
        return create_release(store, &desired).await;
    }

    let mut updated = existing.clone();
    updated.metadata.labels.extend(desired.metadata.labels);
    updated.metadata.owner_references = desired.metadata.owner_references;
    if deployment.spec.reconcile_strategy != ReconcileStrategy::InstallOnce {
        updated.spec = desired.spec;
    }
    let stored = store.update(&updated).await?;
    if stored.metadata.resource_version != existing.metadata.resource_version {
        debug!(
            deployment = %deployment_key,
            release = %stored.metadata.name,
            generation = stored.metadata.generation,
            "release updated"
        );
    }
    Ok(ReleaseOutcome::Applied)
}

/// The existing release of `deployment` on `cluster`, if any.
async fn find_release<S: ResourceStore>(
    store: &S,
    deployment: &ChartDeployment,
    cluster: &Cluster,
) -> ControllerResult<Option<ClusterRelease>> {
    let labels = Labels::from([
        (
            DEPLOYMENT_NAME_LABEL.to_string(),
            deployment.metadata.name.clone(),
        ),
        (CLUSTER_NAME_LABEL.to_string(), cluster.metadata.name.clone()),
    ]);
    let releases: Vec<ClusterRelease> = store
        .list(Some(&deployment.metadata.namespace), &Selector::from_labels(&labels))
        .await?;
    let cluster_key = cluster.metadata.key();
    Ok(releases
        .into_iter()
        .find(|r| r.spec.cluster_ref == cluster_key))
}

/// Create `release`; one still being deleted under the same name is left
/// for a later pass.
async fn create_release<S: ResourceStore>(
    store: &S,
    release: &ClusterRelease,
) -> ControllerResult<ReleaseOutcome> {
    match store.create(release).await {
        Ok(_) => Ok(ReleaseOutcome::Applied),
        Err(StateError::AlreadyExists(_)) => {
            debug!(release = %release.metadata.name, "previous release not yet gone");
            Ok(ReleaseOutcome::Waiting)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_names_are_stable_and_bounded() {
        let cluster = ObjectKey::new("fleet", "eu-1");
        let a = release_name("web", &cluster);
        assert_eq!(a, release_name("web", &cluster));
        assert!(a.starts_with("web-eu-1-"));
        assert_eq!(a.len(), "web-eu-1-".len() + HASH_LEN);

        let other = release_name("web", &ObjectKey::new("other", "eu-1"));
        assert_ne!(a, other);

        let long = release_name(&"d".repeat(80), &cluster);
        assert!(long.len() <= MAX_NAME_LEN);
        assert!(!long.contains("--"));
    }
}
