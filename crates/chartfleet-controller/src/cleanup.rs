//! Orphan cleanup and finalizer-gated teardown.

use chartfleet_state::conditions;
use chartfleet_state::{
    CHART_DEPLOYMENT_FINALIZER, ChartDeployment, Cluster, ClusterRelease, READY,
    ReconcileStrategy, ResourceStore,
};
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::reconciler::ReconcileAction;
use crate::status::RELEASES_READY;

/// Delete releases whose cluster is no longer selected.
///
/// Install-once deployments keep their releases.
pub async fn delete_orphans<S: ResourceStore>(
    store: &S,
    deployment: &ChartDeployment,
    clusters: &[Cluster],
    releases: &[ClusterRelease],
) -> ControllerResult<()> {
    if deployment.spec.reconcile_strategy == ReconcileStrategy::InstallOnce {
        return Ok(());
    }
    for release in releases {
        if release.metadata.is_deleting() {
            continue;
        }
        let selected = clusters
            .iter()
            .any(|c| c.metadata.key() == release.spec.cluster_ref);
        if selected {
            continue;
        }
        delete_release(store, release).await?;
        info!(
            deployment = %deployment.metadata.key(),
            cluster = %release.spec.cluster_ref,
            release = %release.metadata.name,
            "orphaned release deleted"
        );
    }
    Ok(())
}

/// Tear down a deployment being deleted.
///
/// Requests deletion of every release, then checks which are really gone.
/// While any remain, their `Ready` conditions are aggregated and the
/// pass asks to be requeued. Once none remain the finalizer is dropped, which
/// lets the store remove the deployment when the status is patched.
pub async fn reconcile_delete<S: ResourceStore>(
    store: &S,
    deployment: &mut ChartDeployment,
    releases: &[ClusterRelease],
) -> ControllerResult<ReconcileAction> {
    let key = deployment.metadata.key();
    for release in releases {
        delete_release(store, release).await?;
    }

    let mut pending = Vec::new();
    for release in releases {
        match store.get::<ClusterRelease>(&release.metadata.key()).await {
            Ok(r) => pending.push(r),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    if !pending.is_empty() {
        debug!(deployment = %key, pending = pending.len(), "waiting for releases to be deleted");
        // Only their Ready conditions count; an uninstalling release's
        // observed generation is not expected to catch up.
        let ready = conditions::aggregate(
            RELEASES_READY,
            pending
                .iter()
                .map(|r| (r.metadata.name.as_str(), conditions::get(r, READY))),
        );
        conditions::set(deployment, ready);
        return Ok(ReconcileAction::Requeue);
    }

    deployment
        .metadata
        .remove_finalizer(CHART_DEPLOYMENT_FINALIZER);
    info!(deployment = %key, "all releases deleted; finalizer removed");
    Ok(ReconcileAction::Done)
}

async fn delete_release<S: ResourceStore>(store: &S, release: &ClusterRelease) -> ControllerResult<()> {
    match store.delete::<ClusterRelease>(&release.metadata.key()).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
