//! Roll child release readiness up into the deployment's `ReleasesReady`.

use chartfleet_state::conditions::{self, Condition, Severity};
use chartfleet_state::{ChartDeployment, ClusterRelease, READY, ResourceStore};

use crate::error::ControllerResult;
use crate::selection;
use crate::status::{RELEASES_READY, SPECS_UPDATING};

/// `ReleasesReady` for a set of releases.
///
/// An empty set is ready. A release whose installer has not caught up with
/// its spec makes the whole set not ready; otherwise the releases' `Ready`
/// conditions are aggregated.
pub fn releases_ready(releases: &[ClusterRelease]) -> Condition {
    if let Some(lagging) = releases.iter().find(|r| !r.is_up_to_date()) {
        return Condition::new_false(
            RELEASES_READY,
            SPECS_UPDATING,
            Severity::Info,
            format!(
                "release {} has not yet observed generation {}",
                lagging.metadata.name, lagging.metadata.generation
            ),
        );
    }
    conditions::aggregate(
        RELEASES_READY,
        releases
            .iter()
            .map(|r| (r.metadata.name.as_str(), conditions::get(r, READY))),
    )
}

/// Re-list the deployment's releases and record their aggregate readiness.
pub async fn aggregate_readiness<S: ResourceStore>(
    store: &S,
    deployment: &mut ChartDeployment,
) -> ControllerResult<()> {
    let releases = selection::owned_releases(store, deployment).await?;
    conditions::set(deployment, releases_ready(&releases));
    Ok(())
}
