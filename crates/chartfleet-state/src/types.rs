//! Resource types persisted in the chartfleet store.
//!
//! Three kinds live in the store: externally owned [`Cluster`]s, user-facing
//! [`ChartDeployment`]s and the per-cluster [`ClusterRelease`]s the controller
//! materializes from them. All types are serializable to/from JSON for storage
//! in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, Conditioned};
use crate::selector::LabelSelector;
use crate::tables;

/// Label map attached to every object.
pub type Labels = BTreeMap<String, String>;

/// Label linking a [`ClusterRelease`] to its owning [`ChartDeployment`].
pub const DEPLOYMENT_NAME_LABEL: &str = "chartfleet.dev/chartdeployment-name";

/// Label carrying the name of the release's target cluster.
pub const CLUSTER_NAME_LABEL: &str = "chartfleet.dev/cluster-name";

/// Label carrying the deployment generation a release was last reconciled for.
pub const DEPLOYMENT_GENERATION_LABEL: &str = "chartfleet.dev/deployment-generation";

/// Finalizer the controller places on every [`ChartDeployment`].
pub const CHART_DEPLOYMENT_FINALIZER: &str = "chartfleet.dev/chartdeployment";

/// Finalizer the release installer places on [`ClusterRelease`]s it manages.
pub const CLUSTER_RELEASE_FINALIZER: &str = "chartfleet.dev/clusterrelease";

// ── Identity ──────────────────────────────────────────────────────

/// Namespace-scoped identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string.
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, name) = s.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    /// At most one owner reference per object is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

/// Metadata shared by every stored object.
///
/// `generation`, `resource_version`, `creation_timestamp` and
/// `deletion_timestamp` are managed by the store; values supplied by callers
/// are ignored on write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
    /// Bumped by the store whenever the object's spec changes.
    pub generation: i64,
    /// Bumped by the store on every successful write.
    pub resource_version: u64,
    pub finalizers: Vec<String>,
    /// Unix timestamp (seconds) at which deletion was requested.
    pub deletion_timestamp: Option<u64>,
    pub owner_references: Vec<OwnerReference>,
    /// Unix timestamp (seconds) when the object was created.
    pub creation_timestamp: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Build the composite key for the object's table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer. Returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer. Returns false if it was not present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    /// The owner reference flagged as managing controller, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// A kind of object the store can hold.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name used in logs, errors and watch events.
    const KIND: &'static str;

    /// redb table holding objects of this kind.
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Whether `other` carries the same desired state. The store bumps the
    /// generation when this is false.
    fn same_spec(&self, other: &Self) -> bool;

    /// Replace this object's status with `other`'s. Full updates never
    /// change status; only patches do.
    fn copy_status_from(&mut self, other: &Self);

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// A remote cluster. Owned outside chartfleet; only its labels matter here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
}

impl Cluster {
    pub fn new(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Self {
        let mut metadata = ObjectMeta::new(namespace, name);
        metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { metadata }
    }
}

impl Resource for Cluster {
    const KIND: &'static str = "Cluster";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = tables::CLUSTERS;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, _other: &Self) -> bool {
        true
    }

    fn copy_status_from(&mut self, _other: &Self) {}
}

// ── ChartDeployment ───────────────────────────────────────────────

/// Chart to install: repository, chart name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub repo_url: String,
    pub name: String,
    pub version: String,
}

/// How releases are kept in sync after the first install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReconcileStrategy {
    /// Keep releases updated and remove them from deselected clusters.
    #[default]
    Normal,
    /// Install once; never update specs or remove orphaned releases.
    InstallOnce,
}

/// A step size: either an absolute cluster count or a `"<p>%"` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepValue {
    Int(i64),
    Str(String),
}

impl From<i64> for StepValue {
    fn from(v: i64) -> Self {
        StepValue::Int(v)
    }
}

impl From<&str> for StepValue {
    fn from(v: &str) -> Self {
        StepValue::Str(v.to_string())
    }
}

impl fmt::Display for StepValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepValue::Int(v) => write!(f, "{v}"),
            StepValue::Str(s) => f.write_str(s),
        }
    }
}

/// Batch sizing for one rollout phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutOptions {
    /// Size of the first batch.
    pub step_init: StepValue,
    /// Growth of the step after each batch turns ready.
    #[serde(default)]
    pub step_increment: Option<StepValue>,
    /// Upper bound for the step (see the cap rule in `chartfleet-rollout`).
    #[serde(default)]
    pub step_limit: Option<StepValue>,
}

/// Rollout options for the install phase and the upgrade phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RolloutPolicy {
    #[serde(default)]
    pub install: Option<RolloutOptions>,
    #[serde(default)]
    pub upgrade: Option<RolloutOptions>,
}

fn default_release_namespace() -> String {
    "default".to_string()
}

/// Desired state of a chart deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartDeploymentSpec {
    pub chart: ChartRef,
    /// Release name on target clusters; defaults to the chart name.
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default = "default_release_namespace")]
    pub release_namespace: String,
    /// Values template rendered once per cluster.
    #[serde(default)]
    pub values_template: String,
    #[serde(default)]
    pub cluster_selector: LabelSelector,
    #[serde(default)]
    pub reconcile_strategy: ReconcileStrategy,
    #[serde(default)]
    pub rollout: Option<RolloutPolicy>,
}

/// Persisted rollout progress for one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RolloutState {
    /// Clusters given a release in this episode.
    pub count: u32,
    /// Current batch step size.
    pub step_size: u32,
    /// Deployment generation this episode rolls out.
    #[serde(default)]
    pub generation: i64,
}

/// Observed state of a chart deployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartDeploymentStatus {
    pub conditions: Vec<Condition>,
    pub rollout: Option<RolloutState>,
    pub matching_clusters: Vec<ObjectKey>,
    pub observed_generation: i64,
}

/// A chart rolled out to every cluster its selector matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDeployment {
    pub metadata: ObjectMeta,
    pub spec: ChartDeploymentSpec,
    #[serde(default)]
    pub status: ChartDeploymentStatus,
}

impl ChartDeployment {
    pub fn new(namespace: &str, name: &str, spec: ChartDeploymentSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ChartDeploymentStatus::default(),
        }
    }

    /// Release name used on target clusters.
    pub fn release_name(&self) -> &str {
        self.spec
            .release_name
            .as_deref()
            .unwrap_or(&self.spec.chart.name)
    }

    /// Record the clusters currently matched by the selector.
    pub fn set_matching_clusters(&mut self, clusters: &[Cluster]) {
        self.status.matching_clusters = clusters.iter().map(|c| c.metadata.key()).collect();
    }

    /// Rollout progress of the current generation's episode. Progress
    /// persisted for an earlier generation reads as empty.
    pub fn current_rollout(&self) -> RolloutState {
        match self.status.rollout {
            Some(state) if state.generation == self.metadata.generation => state,
            _ => RolloutState {
                generation: self.metadata.generation,
                ..Default::default()
            },
        }
    }
}

impl Conditioned for ChartDeployment {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

impl Resource for ChartDeployment {
    const KIND: &'static str = "ChartDeployment";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
        tables::CHART_DEPLOYMENTS;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// ── ClusterRelease ────────────────────────────────────────────────

/// Desired state of a chart release on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReleaseSpec {
    pub cluster_ref: ObjectKey,
    pub chart: ChartRef,
    pub release_name: String,
    pub release_namespace: String,
    /// Values rendered for this cluster.
    #[serde(default)]
    pub values: String,
}

/// Installer-reported state of a release.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterReleaseStatus {
    pub conditions: Vec<Condition>,
    pub observed_generation: i64,
}

/// Per-cluster materialization of a [`ChartDeployment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRelease {
    pub metadata: ObjectMeta,
    pub spec: ClusterReleaseSpec,
    #[serde(default)]
    pub status: ClusterReleaseStatus,
}

impl ClusterRelease {
    /// Whether the installer has caught up with the current spec.
    pub fn is_up_to_date(&self) -> bool {
        self.status.observed_generation == self.metadata.generation
    }

    /// Ready for the current spec: up to date and `Ready` is True.
    pub fn is_ready(&self) -> bool {
        self.is_up_to_date() && crate::conditions::is_true(self, crate::conditions::READY)
    }

    /// Deployment generation this release was last reconciled for.
    pub fn deployment_generation(&self) -> Option<i64> {
        self.metadata
            .labels
            .get(DEPLOYMENT_GENERATION_LABEL)
            .and_then(|v| v.parse().ok())
    }
}

impl Conditioned for ClusterRelease {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

impl Resource for ClusterRelease {
    const KIND: &'static str = "ClusterRelease";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
        tables::CLUSTER_RELEASES;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChartDeploymentSpec {
        ChartDeploymentSpec {
            chart: ChartRef {
                repo_url: "https://charts.example.com".to_string(),
                name: "nginx".to_string(),
                version: "1.2.3".to_string(),
            },
            release_name: None,
            release_namespace: "default".to_string(),
            values_template: String::new(),
            cluster_selector: LabelSelector::default(),
            reconcile_strategy: ReconcileStrategy::Normal,
            rollout: None,
        }
    }

    #[test]
    fn object_key_parse() {
        assert_eq!(ObjectKey::parse("ns/a"), Some(ObjectKey::new("ns", "a")));
        assert_eq!(ObjectKey::parse("ns/a").unwrap().to_string(), "ns/a");
        assert!(ObjectKey::parse("noslash").is_none());
        assert!(ObjectKey::parse("/a").is_none());
        assert!(ObjectKey::parse("a/b/c").is_none());
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut meta = ObjectMeta::new("ns", "a");
        assert!(meta.add_finalizer("x"));
        assert!(!meta.add_finalizer("x"));
        assert_eq!(meta.finalizers.len(), 1);
        assert!(meta.remove_finalizer("x"));
        assert!(!meta.remove_finalizer("x"));
        assert!(!meta.has_finalizer("x"));
    }

    #[test]
    fn release_name_defaults_to_chart_name() {
        let mut cd = ChartDeployment::new("ns", "web", spec());
        assert_eq!(cd.release_name(), "nginx");
        cd.spec.release_name = Some("edge".to_string());
        assert_eq!(cd.release_name(), "edge");
    }

    #[test]
    fn step_values_decode_from_int_or_string() {
        let opts: RolloutOptions =
            serde_json::from_str(r#"{"step_init":"20%","step_increment":3}"#).unwrap();
        assert_eq!(opts.step_init, StepValue::from("20%"));
        assert_eq!(opts.step_increment, Some(StepValue::Int(3)));
        assert_eq!(opts.step_limit, None);
    }

    #[test]
    fn rollout_progress_from_older_generation_is_ignored() {
        let mut cd = ChartDeployment::new("ns", "web", spec());
        cd.metadata.generation = 2;
        cd.status.rollout = Some(RolloutState {
            count: 5,
            step_size: 3,
            generation: 1,
        });
        assert_eq!(cd.current_rollout().count, 0);
        assert_eq!(cd.current_rollout().generation, 2);

        cd.status.rollout = Some(RolloutState {
            count: 5,
            step_size: 3,
            generation: 2,
        });
        assert_eq!(cd.current_rollout().count, 5);
    }

    #[test]
    fn deployment_spec_defaults() {
        let spec: ChartDeploymentSpec = serde_json::from_str(
            r#"{"chart":{"repo_url":"r","name":"n","version":"1"}}"#,
        )
        .unwrap();
        assert_eq!(spec.release_namespace, "default");
        assert_eq!(spec.reconcile_strategy, ReconcileStrategy::Normal);
        assert!(spec.rollout.is_none());
    }
}
