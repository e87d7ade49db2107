//! One reconcile pass over a chart deployment.
//!
//! A pass is level-triggered: it reads the deployment, the selected clusters
//! and the owned releases fresh, drives the store towards the desired state
//! and finishes with a single status patch, on success and on error alike.

use chartfleet_state::conditions::{self, Severity};
use chartfleet_state::{
    CHART_DEPLOYMENT_FINALIZER, ChartDeployment, ObjectKey, PatchOptions, ResourceStore,
};
use tracing::{debug, info, warn};

use crate::cleanup;
use crate::error::ControllerResult;
use crate::readiness;
use crate::rollout;
use crate::selection;
use crate::status::{self, CLUSTER_SELECTION_FAILED, SPECS_UP_TO_DATE};

/// What the caller should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing further until something changes.
    Done,
    /// Run another pass after the requeue delay.
    Requeue,
}

/// Reconciles chart deployments against a resource store.
#[derive(Clone)]
pub struct Reconciler<S> {
    store: S,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one pass for the deployment at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<ReconcileAction> {
        let mut original: ChartDeployment = match self.store.get(key).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                debug!(deployment = %key, "deployment gone; nothing to do");
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if original.metadata.is_deleting() {
            if !original.metadata.has_finalizer(CHART_DEPLOYMENT_FINALIZER) {
                return Ok(ReconcileAction::Done);
            }
        } else if !original.metadata.has_finalizer(CHART_DEPLOYMENT_FINALIZER) {
            let mut with_finalizer = original.clone();
            with_finalizer
                .metadata
                .add_finalizer(CHART_DEPLOYMENT_FINALIZER);
            original = self
                .store
                .patch(&original, &with_finalizer, &PatchOptions::default())
                .await?;
            debug!(deployment = %key, "finalizer added");
        }

        let mut deployment = original.clone();
        let result = if deployment.metadata.is_deleting() {
            self.reconcile_delete(&mut deployment).await
        } else {
            self.reconcile_normal(&mut deployment).await
        };

        match status::patch_status(&self.store, &original, &mut deployment).await {
            Ok(Some(_)) => {}
            Ok(None) => info!(deployment = %key, "deployment removed"),
            Err(patch_err) => {
                // The pass error, if any, is the more useful one to report.
                if let Err(e) = result {
                    warn!(deployment = %key, error = %patch_err, "status patch failed");
                    return Err(e);
                }
                return Err(patch_err);
            }
        }
        result
    }

    async fn reconcile_normal(&self, deployment: &mut ChartDeployment) -> ControllerResult<ReconcileAction> {
        let clusters = match selection::matching_clusters(
            &self.store,
            &deployment.metadata.namespace,
            &deployment.spec.cluster_selector,
        )
        .await
        {
            Ok(clusters) => clusters,
            Err(e) => {
                conditions::mark_false(
                    deployment,
                    SPECS_UP_TO_DATE,
                    CLUSTER_SELECTION_FAILED,
                    Severity::Error,
                    e.to_string(),
                );
                return Err(e);
            }
        };
        deployment.set_matching_clusters(&clusters);

        let releases = selection::owned_releases(&self.store, deployment).await?;
        cleanup::delete_orphans(&self.store, deployment, &clusters, &releases).await?;

        let action =
            rollout::reconcile_releases(&self.store, deployment, &clusters, &releases).await?;

        readiness::aggregate_readiness(&self.store, deployment).await?;
        conditions::mark_true(deployment, SPECS_UP_TO_DATE);
        Ok(action)
    }

    async fn reconcile_delete(&self, deployment: &mut ChartDeployment) -> ControllerResult<ReconcileAction> {
        let releases = selection::owned_releases(&self.store, deployment).await?;
        cleanup::reconcile_delete(&self.store, deployment, &releases).await
    }
}
