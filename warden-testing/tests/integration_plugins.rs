//! Plugins and the floating address loop driven by a live cluster.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_core::configurator::InMemoryConfigurator;
use warden_core::{NodeId, Observation, ObservationFilter};
use warden_leader::plugins::{MetadataPlugin, VirtualIpPlugin};
use warden_leader::{
    ObserverDispatcher, Plugin, PluginContext, PluginError, PluginRegistry, PluginResult,
    ReconciliationLoop,
};
use warden_testing::{eventually, init_tracing, ClusterHarness, DEFAULT_WAIT};

#[derive(Default)]
struct Counters {
    handled: AtomicUsize,
    shutdowns: AtomicUsize,
}

struct Counting {
    name: &'static str,
    fail: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl Plugin for Counting {
    fn name(&self) -> &str {
        self.name
    }

    async fn setup(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    fn filter(&self) -> ObservationFilter {
        ObservationFilter::All
    }

    async fn handle(&mut self, _observation: &Observation) -> PluginResult<()> {
        self.counters.handled.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PluginError::config("handler always fails"));
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn started(size: usize) -> (ClusterHarness, NodeId) {
    init_tracing();
    let mut harness = ClusterHarness::new(size).unwrap();
    harness.start_all().await.unwrap();
    let leader = harness
        .wait_for_leader(DEFAULT_WAIT)
        .await
        .expect("no leader elected");
    (harness, leader)
}

#[tokio::test]
async fn test_failing_plugin_does_not_block_others() {
    let (mut harness, leader) = started(3).await;
    let manager = harness.manager(&leader).unwrap();
    let store = tempfile::tempdir().unwrap();

    let failing = Arc::new(Counters::default());
    let healthy = Arc::new(Counters::default());
    let registry = PluginRegistry::new(vec![
        Box::new(Counting {
            name: "failing",
            fail: true,
            counters: failing.clone(),
        }),
        Box::new(Counting {
            name: "healthy",
            fail: false,
            counters: healthy.clone(),
        }),
    ])
    .unwrap();
    let ctx = PluginContext {
        node_id: leader.clone(),
        store_path: store.path().to_path_buf(),
        raw_config: Arc::from(&b"{}"[..]),
        cluster: manager.clone(),
    };
    let mut dispatcher = ObserverDispatcher::start(registry, ctx, manager.clone())
        .await
        .unwrap();

    // Each configuration change is observed; so are the failed heartbeats
    // to members that do not exist
    for n in 4..=5 {
        manager
            .add_member(
                NodeId::new(format!("node-{}", n)),
                format!("10.0.0.{}:7300", n),
                false,
            )
            .await
            .unwrap();
    }

    let (failing_ref, healthy_ref) = (&failing, &healthy);
    assert!(
        eventually(DEFAULT_WAIT, || async move {
            failing_ref.handled.load(Ordering::SeqCst) >= 2
                && healthy_ref.handled.load(Ordering::SeqCst) >= 2
        })
        .await
    );

    dispatcher.shutdown().await;
    assert_eq!(failing.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.shutdowns.load(Ordering::SeqCst), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_metadata_tracks_leader_on_every_node() {
    let (mut harness, leader) = started(3).await;

    let mut outputs = BTreeMap::new();
    let mut dispatchers = Vec::new();
    for (id, manager) in harness.running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = PluginContext {
            node_id: id.clone(),
            store_path: dir.path().to_path_buf(),
            raw_config: Arc::from(&b"{}"[..]),
            cluster: manager.clone(),
        };
        let registry = PluginRegistry::new(vec![Box::new(MetadataPlugin::new())]).unwrap();
        dispatchers.push(
            ObserverDispatcher::start(registry, ctx, manager.clone())
                .await
                .unwrap(),
        );
        outputs.insert(id, dir);
    }

    // Failing over produces observations everywhere
    harness.stop_node(&leader).await;
    let new_leader = harness
        .wait_for_new_leader(&leader, DEFAULT_WAIT)
        .await
        .expect("no new leader");

    for (id, dir) in &outputs {
        if id == &leader {
            continue;
        }
        let path = dir.path().join("metadata.json");
        let expected = new_leader.to_string();
        let (path, expected) = (&path, &expected);
        assert!(
            eventually(DEFAULT_WAIT, || async move {
                match tokio::fs::read(path).await {
                    Ok(body) => serde_json::from_slice::<serde_json::Value>(&body)
                        .map(|json| json["leader"] == expected.as_str())
                        .unwrap_or(false),
                    Err(_) => false,
                }
            })
            .await,
            "metadata on {} never named {}",
            id,
            new_leader
        );
    }

    for mut dispatcher in dispatchers {
        dispatcher.shutdown().await;
    }
    for dir in outputs.values() {
        assert!(!dir.path().join("metadata.json").exists());
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_floating_address_follows_leader() {
    let (mut harness, leader) = started(3).await;

    let mut configurators = BTreeMap::new();
    let mut loops = BTreeMap::new();
    for (id, manager) in harness.running() {
        let configurator = Arc::new(InMemoryConfigurator::new());
        let handle = ReconciliationLoop::new(
            manager.leadership_notifications().unwrap(),
            configurator.clone(),
        )
        .with_interval(Duration::from_millis(20))
        .spawn();
        configurators.insert(id.clone(), configurator);
        loops.insert(id, handle);
    }

    let configurators_ref = &configurators;
    let holders = || {
        configurators_ref
            .iter()
            .filter(|(_, c)| c.is_present())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>()
    };
    let (holders, leader_ref) = (&holders, &leader);
    assert!(
        eventually(DEFAULT_WAIT, || async move { holders() == vec![leader_ref.clone()] }).await
    );

    // Stopping while leader releases before the loop reports completion
    if let Some(handle) = loops.remove(&leader) {
        handle.stop().await;
    }
    assert!(!configurators[&leader].is_present());
    harness.stop_node(&leader).await;

    let new_leader = harness
        .wait_for_new_leader(&leader, DEFAULT_WAIT)
        .await
        .expect("no new leader");
    let new_leader_ref = &new_leader;
    assert!(
        eventually(DEFAULT_WAIT, || async move {
            holders() == vec![new_leader_ref.clone()]
        })
        .await
    );

    for (_, handle) in loops {
        handle.stop().await;
    }
    assert!(configurators.values().all(|c| !c.is_present()));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_virtual_ip_plugin_follows_leader() {
    let (mut harness, leader) = started(3).await;

    let mut configurators = BTreeMap::new();
    let mut dispatchers = Vec::new();
    let store = tempfile::tempdir().unwrap();
    for (id, manager) in harness.running() {
        let configurator = Arc::new(InMemoryConfigurator::new());
        let ctx = PluginContext {
            node_id: id.clone(),
            store_path: store.path().to_path_buf(),
            raw_config: Arc::from(&b"{}"[..]),
            cluster: manager.clone(),
        };
        let plugin = VirtualIpPlugin::with_configurator(configurator.clone());
        let registry = PluginRegistry::new(vec![Box::new(plugin)]).unwrap();
        dispatchers.push(
            ObserverDispatcher::start(registry, ctx, manager.clone())
                .await
                .unwrap(),
        );
        configurators.insert(id, configurator);
    }

    // The leader change observations must already see the new leader
    harness.stop_node(&leader).await;
    let new_leader = harness
        .wait_for_new_leader(&leader, DEFAULT_WAIT)
        .await
        .expect("no new leader");

    let (configurators_ref, new_leader_ref, leader_ref) = (&configurators, &new_leader, &leader);
    assert!(
        eventually(DEFAULT_WAIT, || async move {
            configurators_ref
                .iter()
                .filter(|(id, _)| *id != leader_ref)
                .all(|(id, c)| c.is_present() == (id == new_leader_ref))
        })
        .await
    );

    for mut dispatcher in dispatchers {
        dispatcher.shutdown().await;
    }
    assert!(configurators.values().all(|c| !c.is_present()));
    harness.shutdown().await;
}
