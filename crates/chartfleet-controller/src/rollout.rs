//! Drives the rollout planner against the store.

use std::collections::HashMap;

use chartfleet_rollout::{
    BatchEntry, BatchMetadata, ReleaseState, RolloutDecision, RolloutGate, RolloutPlanner,
    active_phase,
};
use chartfleet_state::conditions::{self, Severity};
use chartfleet_state::{ChartDeployment, Cluster, ClusterRelease, ObjectKey, ResourceStore};
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::reconciler::ReconcileAction;
use crate::release::{ReleaseOutcome, reconcile_for_cluster};
use crate::status::{ROLLOUT_COMPLETED, ROLLOUT_NOT_COMPLETE, ROLLOUT_NOT_USED};

/// Batch metadata for the deployment's current episode.
///
/// A release belongs to the episode when it was last reconciled for the
/// deployment's current generation.
pub fn batch_metadata(
    deployment: &ChartDeployment,
    clusters: &[Cluster],
    releases: &[ClusterRelease],
) -> BatchMetadata {
    let generation = deployment.metadata.generation;
    let by_cluster: HashMap<&ObjectKey, &ClusterRelease> = releases
        .iter()
        .filter(|r| !r.metadata.is_deleting())
        .map(|r| (&r.spec.cluster_ref, r))
        .collect();

    BatchMetadata::new(clusters.iter().map(|cluster| {
        let key = cluster.metadata.key();
        let state = match by_cluster.get(&key) {
            Some(r) if r.deployment_generation() == Some(generation) => {
                if r.is_ready() {
                    ReleaseState::Ready
                } else {
                    ReleaseState::Pending
                }
            }
            _ => ReleaseState::Missing,
        };
        BatchEntry::new(key, state)
    }))
}

/// Reconcile releases for the selected clusters, staged by the rollout
/// policy of the active phase if there is one.
pub async fn reconcile_releases<S: ResourceStore>(
    store: &S,
    deployment: &mut ChartDeployment,
    clusters: &[Cluster],
    releases: &[ClusterRelease],
) -> ControllerResult<ReconcileAction> {
    let key = deployment.metadata.key();
    let phase = active_phase(deployment.metadata.generation, deployment.spec.rollout.as_ref());
    let Some(phase) = phase else {
        let mut waiting = false;
        for cluster in clusters {
            waiting |= reconcile_for_cluster(store, deployment, cluster).await?
                == ReleaseOutcome::Waiting;
        }
        conditions::mark_true_with_reason(
            deployment,
            ROLLOUT_COMPLETED,
            ROLLOUT_NOT_USED,
            "rollout not used",
        );
        return Ok(if waiting {
            ReconcileAction::Requeue
        } else {
            ReconcileAction::Done
        });
    };

    let Some(options) = deployment
        .spec
        .rollout
        .as_ref()
        .and_then(|policy| phase.options(policy))
        .cloned()
    else {
        return Ok(ReconcileAction::Done);
    };

    let state = deployment.current_rollout();
    let batch = batch_metadata(deployment, clusters, releases);
    let key_str = key.to_string();
    let decision = RolloutPlanner::new(&key_str, &options).plan(state, &batch);
    let plan = match decision {
        Ok(RolloutDecision::Completed) => {
            conditions::mark_true(deployment, ROLLOUT_COMPLETED);
            return Ok(ReconcileAction::Done);
        }
        Ok(RolloutDecision::Hold(gate)) => {
            mark_not_complete(deployment, clusters.len(), batch.existing());
            debug!(deployment = %key, ?phase, ?gate, "waiting for readiness");
            return Ok(ReconcileAction::Requeue);
        }
        Ok(RolloutDecision::Proceed(plan)) => plan,
        Err(e) => {
            mark_not_complete(deployment, clusters.len(), batch.existing());
            return Err(e.into());
        }
    };

    let by_key: HashMap<ObjectKey, &Cluster> =
        clusters.iter().map(|c| (c.metadata.key(), c)).collect();
    let mut processed = 0;
    let mut result = Ok(());
    for target in &plan.targets {
        let Some(cluster) = by_key.get(target) else {
            continue;
        };
        match reconcile_for_cluster(store, deployment, cluster).await {
            Ok(ReleaseOutcome::Applied) => processed += 1,
            // The batch resumes once the old release is gone.
            Ok(ReleaseOutcome::Waiting) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    if let Some(progress) = plan.progress_after(processed) {
        info!(
            deployment = %key,
            ?phase,
            gate = ?plan.gate,
            count = progress.count,
            step_size = progress.step_size,
            "rollout progressed"
        );
        deployment.status.rollout = Some(progress);
    }
    let rolled_out = match plan.gate {
        RolloutGate::WaitingForReadiness => batch.existing(),
        _ => batch.existing() + processed,
    };
    mark_not_complete(deployment, clusters.len(), rolled_out);
    result?;
    Ok(ReconcileAction::Requeue)
}

/// `rolled_out` is the number of selected clusters with a release of the
/// episode; a persisted count above it is not trusted.
fn mark_not_complete(deployment: &mut ChartDeployment, candidates: usize, rolled_out: usize) {
    let count = (deployment.current_rollout().count as usize).min(rolled_out);
    let remaining = candidates.saturating_sub(count);
    conditions::mark_false(
        deployment,
        ROLLOUT_COMPLETED,
        ROLLOUT_NOT_COMPLETE,
        Severity::Info,
        format!("{remaining} releases not yet rolled out"),
    );
}
