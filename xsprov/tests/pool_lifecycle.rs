//! Pool membership and shared storage across several fake hosts.

mod common;

use std::time::Duration;

use serde_json::json;

use xsprov::Reconciler;
use xsprov::reconciler::pool::{JoinSupporter, PoolConfig, PoolReconciler};
use xsprov::reconciler::sr::nfs::{NfsSrConfig, NfsSrReconciler};
use xsprov::test_util::FakeCluster;
use xsprov::xapi::ObjectKind;

fn reconciler() -> PoolReconciler {
    PoolReconciler {
        convergence: common::fast_policy(),
        eject: common::fast_policy(),
        settle: Duration::ZERO,
    }
}

fn supporter(host: &str) -> JoinSupporter {
    JoinSupporter {
        host: host.to_string(),
        username: "root".to_string(),
        password: "secret".to_string(),
    }
}

fn nfs_storage() -> NfsSrConfig {
    serde_json::from_value(json!({
        "name_label": "shared",
        "storage_location": "10.0.0.30:/exports/vms",
    }))
    .unwrap()
}

#[tokio::test]
async fn pool_grows_swaps_and_dissolves_around_shared_storage() {
    let cluster = FakeCluster::new();
    let coordinator = cluster.add_standalone("10.0.0.1", "host-a");
    let first = cluster.add_standalone("10.0.0.2", "host-b");
    let second = cluster.add_standalone("10.0.0.3", "host-c");
    let ctx = cluster.context("10.0.0.1").await.unwrap();

    let storage = NfsSrReconciler.create(&ctx, &nfs_storage()).await.unwrap();
    assert_eq!(storage.storage_location, "10.0.0.30:/exports/vms");

    let pool = reconciler();
    let config = PoolConfig {
        name_label: "lab".to_string(),
        default_sr: Some(storage.uuid.clone()),
        join_supporters: vec![supporter("10.0.0.2")],
        ..Default::default()
    };
    let state = pool.create(&ctx, &config).await.unwrap();
    assert_eq!(state.default_sr, storage.uuid);
    assert_eq!(state.supporters, vec!["host-b"]);
    assert_eq!(first.member_of().as_deref(), Some("10.0.0.1"));

    let swapped = PoolConfig {
        join_supporters: vec![supporter("10.0.0.3")],
        eject_supporters: ["host-b".to_string()].into(),
        ..config.clone()
    };
    let state = pool.update(&ctx, &swapped, &state).await.unwrap();
    assert_eq!(state.supporters, vec!["host-c"]);
    assert_eq!(first.member_of(), None);
    assert_eq!(second.member_of().as_deref(), Some("10.0.0.1"));
    assert_eq!(first.calls_to("pool.join").len(), 1);

    let refreshed = pool.read(&ctx, &state).await.unwrap();
    assert_eq!(refreshed.supporters, state.supporters);
    assert_eq!(refreshed.name_label, "lab");

    pool.delete(&ctx, &state).await.unwrap();
    assert_eq!(coordinator.count(ObjectKind::Host), 1);
    assert_eq!(second.member_of(), None);

    NfsSrReconciler.delete(&ctx, &storage).await.unwrap();
    assert_eq!(coordinator.count(ObjectKind::Sr), 0);
    assert_eq!(coordinator.count(ObjectKind::Pbd), 0);
}

#[tokio::test]
async fn unreachable_supporter_fails_without_touching_the_pool() {
    let cluster = FakeCluster::new();
    let coordinator = cluster.add_standalone("10.0.0.1", "host-a");
    let ctx = cluster.context("10.0.0.1").await.unwrap();

    let config = PoolConfig {
        name_label: "lab".to_string(),
        join_supporters: vec![supporter("10.0.0.9")],
        ..Default::default()
    };
    let err = reconciler().create(&ctx, &config).await.unwrap_err();
    assert!(err.to_string().contains("10.0.0.9"));
    assert!(coordinator.mutations().is_empty());
}
