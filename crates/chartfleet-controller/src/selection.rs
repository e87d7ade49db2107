//! Cluster selection and the per-deployment release registry.
//!
//! Both are read fresh from the store on every pass.

use chartfleet_state::{
    ChartDeployment, Cluster, ClusterRelease, DEPLOYMENT_NAME_LABEL, LabelSelector, Labels,
    ResourceStore, Selector,
};
use tracing::debug;

use crate::error::ControllerResult;

/// All clusters in `namespace` matching `selector`, ordered by name.
pub async fn matching_clusters<S: ResourceStore>(
    store: &S,
    namespace: &str,
    selector: &LabelSelector,
) -> ControllerResult<Vec<Cluster>> {
    let selector = selector.to_selector()?;
    let clusters: Vec<Cluster> = store.list(Some(namespace), &selector).await?;
    debug!(%namespace, %selector, matched = clusters.len(), "clusters selected");
    Ok(clusters)
}

/// Selector for the releases owned by `deployment`.
pub fn release_selector(deployment: &ChartDeployment) -> Selector {
    let labels = Labels::from([(
        DEPLOYMENT_NAME_LABEL.to_string(),
        deployment.metadata.name.clone(),
    )]);
    Selector::from_labels(&labels)
}

/// Every release labelled as belonging to `deployment`.
pub async fn owned_releases<S: ResourceStore>(
    store: &S,
    deployment: &ChartDeployment,
) -> ControllerResult<Vec<ClusterRelease>> {
    let releases = store
        .list(Some(&deployment.metadata.namespace), &release_selector(deployment))
        .await?;
    Ok(releases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartfleet_state::{ObjectMeta, StateError, StateStore};

    fn release(ns: &str, name: &str, owner: &str) -> ClusterRelease {
        let mut metadata = ObjectMeta::new(ns, name);
        metadata
            .labels
            .insert(DEPLOYMENT_NAME_LABEL.to_string(), owner.to_string());
        serde_json::from_value(serde_json::json!({
            "metadata": metadata,
            "spec": {
                "cluster_ref": {"namespace": ns, "name": "c"},
                "chart": {"repo_url": "r", "name": "n", "version": "1"},
                "release_name": "n",
                "release_namespace": "default"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn selects_matching_clusters_in_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(&Cluster::new("fleet", "a", &[("env", "prod")])).await.unwrap();
        store.create(&Cluster::new("fleet", "b", &[("env", "dev")])).await.unwrap();
        store.create(&Cluster::new("other", "c", &[("env", "prod")])).await.unwrap();

        let selector = LabelSelector::matching_labels(&[("env", "prod")]);
        let clusters = matching_clusters(&store, "fleet", &selector).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].metadata.name, "a");
    }

    #[tokio::test]
    async fn malformed_selector_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert("bad key".to_string(), "x".to_string());
        let err = matching_clusters(&store, "fleet", &selector).await.unwrap_err();
        assert!(matches!(
            err,
            crate::ControllerError::State(StateError::InvalidSelector(_))
        ));
    }

    #[tokio::test]
    async fn lists_only_owned_releases() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(&release("fleet", "web-a", "web")).await.unwrap();
        store.create(&release("fleet", "api-a", "api")).await.unwrap();
        store.create(&release("other", "web-b", "web")).await.unwrap();

        let deployment: ChartDeployment = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "fleet", "name": "web"},
            "spec": {"chart": {"repo_url": "r", "name": "n", "version": "1"}}
        }))
        .unwrap();
        let owned = owned_releases(&store, &deployment).await.unwrap();
        let names: Vec<_> = owned.iter().map(|r| r.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["web-a"]);
    }
}
