//! The controller loop driven by store events.

use std::time::Duration;

use chartfleet_controller::{ControllerConfig, Manager};
use chartfleet_state::{
    ChartDeployment, ChartDeploymentSpec, ChartRef, Cluster, ClusterRelease, LabelSelector,
    ObjectKey, ReconcileStrategy, ResourceStore, Selector, StateStore,
};
use tokio::sync::watch;

fn spec() -> ChartDeploymentSpec {
    ChartDeploymentSpec {
        chart: ChartRef {
            repo_url: "https://charts.example".to_string(),
            name: "web".to_string(),
            version: "1.0.0".to_string(),
        },
        release_name: None,
        release_namespace: "default".to_string(),
        values_template: String::new(),
        cluster_selector: LabelSelector::matching_labels(&[("env", "prod")]),
        reconcile_strategy: ReconcileStrategy::Normal,
        rollout: None,
    }
}

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        requeue_after: Duration::from_millis(50),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
    }
}

/// Poll until the store holds `n` releases for clusters named in `expected`.
async fn wait_for_releases(store: &StateStore, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let releases: Vec<ClusterRelease> =
            store.list(Some("fleet"), &Selector::everything()).await.unwrap();
        let mut names: Vec<String> = releases
            .into_iter()
            .filter(|r| !r.metadata.is_deleting())
            .map(|r| r.spec.cluster_ref.name)
            .collect();
        names.sort();
        if names == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected:?}, have {names:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn reacts_to_cluster_changes_until_shutdown() {
    let store = StateStore::open_in_memory().unwrap();
    store
        .create(&Cluster::new("fleet", "a", &[("env", "prod")]))
        .await
        .unwrap();
    store
        .create(&ChartDeployment::new("fleet", "web", spec()))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = Manager::new(store.clone(), config());
    let handle = tokio::spawn(manager.run(shutdown_rx));

    // Existing deployments are picked up at start.
    wait_for_releases(&store, &["a"]).await;

    // A newly matching cluster gets a release.
    store
        .create(&Cluster::new("fleet", "b", &[("env", "prod")]))
        .await
        .unwrap();
    wait_for_releases(&store, &["a", "b"]).await;

    // A cluster that stops matching loses its release.
    let mut a: Cluster = store.get(&ObjectKey::new("fleet", "a")).await.unwrap();
    a.metadata.labels.insert("env".to_string(), "dev".to_string());
    store.update(&a).await.unwrap();
    wait_for_releases(&store, &["b"]).await;

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("manager did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn deleted_deployment_is_torn_down() {
    let store = StateStore::open_in_memory().unwrap();
    store
        .create(&Cluster::new("fleet", "a", &[("env", "prod")]))
        .await
        .unwrap();
    store
        .create(&ChartDeployment::new("fleet", "web", spec()))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Manager::new(store.clone(), config()).run(shutdown_rx));
    wait_for_releases(&store, &["a"]).await;

    let key = ObjectKey::new("fleet", "web");
    store.delete::<ChartDeployment>(&key).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match store.get::<ChartDeployment>(&key).await {
            Err(e) if e.is_not_found() => break,
            _ => {
                assert!(tokio::time::Instant::now() < deadline, "deployment not removed");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    wait_for_releases(&store, &[]).await;

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn dropped_shutdown_sender_lets_queued_work_finish() {
    let store = StateStore::open_in_memory().unwrap();
    store
        .create(&Cluster::new("fleet", "a", &[("env", "prod")]))
        .await
        .unwrap();
    store
        .create(&ChartDeployment::new("fleet", "web", spec()))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(shutdown_tx);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Manager::new(store.clone(), config()).run(shutdown_rx),
    )
    .await
    .expect("manager did not stop");
    assert!(result.is_ok());

    // The pass queued at start ran to completion before the workers left.
    wait_for_releases(&store, &["a"]).await;
}
