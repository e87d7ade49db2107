//! Condition vocabulary of a chart deployment and the end-of-pass status patch.

use chartfleet_state::conditions;
use chartfleet_state::{ChartDeployment, PatchOptions, READY, ResourceStore};
use tracing::debug;

use crate::error::ControllerResult;

/// Every selected cluster has an up-to-date release spec.
pub const SPECS_UP_TO_DATE: &str = "SpecsUpToDate";

/// Aggregate readiness of the deployment's releases.
pub const RELEASES_READY: &str = "ReleasesReady";

/// Every selected cluster has been reached by the current rollout episode.
pub const ROLLOUT_COMPLETED: &str = "RolloutCompleted";

pub const CLUSTER_SELECTION_FAILED: &str = "ClusterSelectionFailed";
pub const VALUE_PARSING_FAILED: &str = "ValueParsingFailed";
pub const ROLLOUT_NOT_USED: &str = "RolloutNotUsed";
pub const ROLLOUT_NOT_COMPLETE: &str = "RolloutNotComplete";
pub const SPECS_UPDATING: &str = "SpecsUpdating";

/// Conditions folded into `Ready`.
pub const SUMMARY_CONDITIONS: [&str; 3] = [SPECS_UP_TO_DATE, RELEASES_READY, ROLLOUT_COMPLETED];

/// Conditions this controller owns on a chart deployment.
pub const OWNED_CONDITIONS: [&str; 4] =
    [READY, SPECS_UP_TO_DATE, RELEASES_READY, ROLLOUT_COMPLETED];

/// Summarize, stamp the observed generation and patch `deployment` over
/// `original`. Returns the stored object, or `None` if the write removed it.
pub async fn patch_status<S: ResourceStore>(
    store: &S,
    original: &ChartDeployment,
    deployment: &mut ChartDeployment,
) -> ControllerResult<Option<ChartDeployment>> {
    conditions::set_summary(deployment, &SUMMARY_CONDITIONS);
    deployment.status.observed_generation = deployment.metadata.generation;

    let gone = deployment.metadata.is_deleting() && deployment.metadata.finalizers.is_empty();
    let stored = store
        .patch(
            original,
            deployment,
            &PatchOptions::owning_conditions(OWNED_CONDITIONS),
        )
        .await?;
    debug!(
        deployment = %stored.metadata.key(),
        resource_version = stored.metadata.resource_version,
        "status patched"
    );
    Ok((!gone).then_some(stored))
}
