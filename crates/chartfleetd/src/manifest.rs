//! Manifests: clusters and chart deployments to load into the store.
//!
//! A manifest holds `cluster` and `chart_deployment` arrays. Files ending in
//! `.json` are parsed as JSON, anything else as TOML:
//!
//! ```toml
//! [[cluster]]
//! metadata = { namespace = "fleet", name = "eu-1", labels = { env = "prod" } }
//!
//! [[chart_deployment]]
//! metadata = { namespace = "fleet", name = "web" }
//! spec.chart = { repo_url = "https://charts.example", name = "web", version = "1.2.0" }
//! spec.cluster_selector.match_labels = { env = "prod" }
//! spec.rollout.install = { step_init = "20%", step_increment = "20%", step_limit = "50%" }
//! ```

use std::path::Path;

use chartfleet_state::{ChartDeployment, Cluster, Resource, ResourceStore, StateResult};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<Cluster>,
    #[serde(default, rename = "chart_deployment")]
    pub chart_deployments: Vec<ChartDeployment>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn len(&self) -> usize {
        self.clusters.len() + self.chart_deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create or update every object. Clusters go first so deployments
    /// see them on their first pass.
    pub async fn apply<S: ResourceStore>(&self, store: &S) -> StateResult<()> {
        for cluster in &self.clusters {
            apply_one(store, cluster).await?;
        }
        for deployment in &self.chart_deployments {
            apply_one(store, deployment).await?;
        }
        Ok(())
    }
}

/// Create `obj`, or replace the stored object's labels and spec with it.
/// Finalizers and owners on the stored object are kept.
async fn apply_one<S: ResourceStore, R: Resource>(store: &S, obj: &R) -> StateResult<()> {
    let key = obj.key();
    match store.get::<R>(&key).await {
        Ok(existing) => {
            let mut next = obj.clone();
            let meta = next.metadata_mut();
            let current = existing.metadata();
            meta.resource_version = current.resource_version;
            meta.finalizers = current.finalizers.clone();
            meta.owner_references = current.owner_references.clone();
            let stored = store.update(&next).await?;
            info!(kind = R::KIND, %key, generation = stored.metadata().generation, "configured");
        }
        Err(e) if e.is_not_found() => {
            store.create(obj).await?;
            info!(kind = R::KIND, %key, "created");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartfleet_state::{CHART_DEPLOYMENT_FINALIZER, ObjectKey, Selector, StateStore, StepValue};

    const MANIFEST: &str = r#"
[[cluster]]
metadata = { namespace = "fleet", name = "eu-1", labels = { env = "prod" } }

[[cluster]]
metadata = { namespace = "fleet", name = "us-1", labels = { env = "prod" } }

[[chart_deployment]]
metadata = { namespace = "fleet", name = "web" }
spec.chart = { repo_url = "https://charts.example", name = "web", version = "1.2.0" }
spec.values_template = "region: {{ .Cluster.metadata.name }}"
spec.cluster_selector.match_labels = { env = "prod" }
spec.rollout.install = { step_init = "20%", step_increment = 1 }
"#;

    #[test]
    fn parses_toml() {
        let manifest = Manifest::from_toml(MANIFEST).unwrap();
        assert_eq!(manifest.len(), 3);
        let web = &manifest.chart_deployments[0];
        assert_eq!(web.spec.release_namespace, "default");
        let install = web.spec.rollout.as_ref().unwrap().install.as_ref().unwrap();
        assert_eq!(install.step_init, StepValue::Str("20%".to_string()));
        assert_eq!(install.step_increment, Some(StepValue::Int(1)));
        assert!(install.step_limit.is_none());
    }

    #[test]
    fn parses_json() {
        let manifest = Manifest::from_json(
            r#"{"cluster": [{"metadata": {"namespace": "fleet", "name": "eu-1"}}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.clusters.len(), 1);
        assert!(manifest.chart_deployments.is_empty());
    }

    #[test]
    fn from_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("fleet.json");
        std::fs::write(&json, r#"{"chart_deployment": []}"#).unwrap();
        assert!(Manifest::from_file(&json).unwrap().is_empty());

        let toml_path = dir.path().join("fleet.toml");
        std::fs::write(&toml_path, MANIFEST).unwrap();
        assert_eq!(Manifest::from_file(&toml_path).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn apply_creates_then_updates_preserving_finalizers() {
        let store = StateStore::open_in_memory().unwrap();
        let manifest = Manifest::from_toml(MANIFEST).unwrap();
        manifest.apply(&store).await.unwrap();

        let clusters: Vec<Cluster> = store.list(Some("fleet"), &Selector::everything()).await.unwrap();
        assert_eq!(clusters.len(), 2);

        // Simulate the controller having claimed the deployment.
        let key = ObjectKey::new("fleet", "web");
        let mut stored: ChartDeployment = store.get(&key).await.unwrap();
        stored.metadata.add_finalizer(CHART_DEPLOYMENT_FINALIZER);
        store.update(&stored).await.unwrap();

        let mut edited = manifest.clone();
        edited.chart_deployments[0].spec.chart.version = "1.3.0".to_string();
        edited.apply(&store).await.unwrap();

        let stored: ChartDeployment = store.get(&key).await.unwrap();
        assert_eq!(stored.spec.chart.version, "1.3.0");
        assert_eq!(stored.metadata.generation, 2);
        assert!(stored.metadata.has_finalizer(CHART_DEPLOYMENT_FINALIZER));
    }
}
