#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::{labels, ComponentStatus};
use keel_kubehub::{KubeObject, ObjectKind, WatchEvent};
use keel_store::{spawn_ingest, Store};

fn meta(name: &str, rv: &str) -> ObjectMeta { meta_for("c1", name, rv) }

fn meta_for(id: &str, name: &str, rv: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some("t1".into()),
        resource_version: Some(rv.into()),
        labels: Some(BTreeMap::from([
            (labels::COMPONENT_ID.to_string(), id.to_string()),
            (labels::TENANT_ID.to_string(), "tenant-1".to_string()),
        ])),
        ..Default::default()
    }
}

fn sts(rv: &str, ready: i32) -> KubeObject {
    KubeObject::from(StatefulSet {
        metadata: meta("db", rv),
        spec: Some(StatefulSetSpec { replicas: Some(1), ..Default::default() }),
        status: Some(StatefulSetStatus { ready_replicas: Some(ready), replicas: 1, ..Default::default() }),
    })
}

fn pod(rv: &str) -> KubeObject { pod_for("c1", "db-0", rv) }

fn pod_for(id: &str, name: &str, rv: &str) -> KubeObject {
    let req: BTreeMap<String, Quantity> = BTreeMap::from([("cpu".to_string(), Quantity("250m".into()))]);
    KubeObject::from(Pod {
        metadata: meta_for(id, name, rv),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "db".into(),
                resources: Some(ResourceRequirements { requests: Some(req), ..Default::default() }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[test]
fn replay_basic_sequence() {
    let store = Store::new();
    let events = vec![
        WatchEvent::Applied(sts("1", 0)),
        WatchEvent::Applied(pod("2")),
        WatchEvent::Applied(sts("3", 1)),
        WatchEvent::Deleted(pod("4")),
        WatchEvent::Deleted(sts("5", 1)),
    ];

    for ev in events[..3].iter().cloned() {
        store.apply(ev);
    }
    assert_eq!(store.component_status("c1"), ComponentStatus::Running);
    store.publish_tenants();
    assert_eq!(store.tenant_resource("tenant-1").map(|t| t.cpu_request_millis), Some(250));

    for ev in events[3..].iter().cloned() {
        store.apply(ev);
    }
    assert!(store.get_component("c1").is_none());
    let snap = store.tenant_resource_list();
    assert_eq!(snap.epoch, 1);
    store.publish_tenants();
    assert!(store.tenant_resource("tenant-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn ingest_flushes_before_marking_synced() {
    let store = Arc::new(Store::new());
    let (tx, handle) = spawn_ingest(store.clone(), 16);
    let mut epochs = store.subscribe_epoch();

    tx.send(WatchEvent::Applied(sts("1", 0))).await.unwrap();
    tx.send(WatchEvent::Applied(sts("2", 1))).await.unwrap();
    for kind in ObjectKind::REQUIRED {
        tx.send(WatchEvent::Synced(kind)).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();

    assert!(store.ready());
    let c = store.get_component("c1").unwrap();
    assert_eq!(c.workload().resource_version(), Some("2"));
    assert!(epochs.has_changed().unwrap_or(false));
}

#[test]
fn relist_forgets_objects_deleted_while_the_watch_was_down() {
    let store = Store::new();
    store.apply(WatchEvent::Applied(sts("1", 1)));
    store.apply(WatchEvent::Applied(pod("2")));
    store.apply(WatchEvent::Applied(pod_for("c1", "db-1", "3")));
    assert_eq!(store.get_component("c1").map(|c| c.pods().len()), Some(2));

    store.apply(WatchEvent::Replaced(ObjectKind::Pod, vec![pod_for("c1", "db-1", "4")]));
    assert!(store.object(ObjectKind::Pod, "t1", "db-0").is_none());
    let c = store.get_component("c1").unwrap();
    let names: Vec<_> = c.pods().iter().filter_map(|p| p.metadata.name.clone()).collect();
    assert_eq!(names, vec!["db-1".to_string()]);
    assert_eq!(c.workload().resource_version(), Some("1"));

    store.apply(WatchEvent::Replaced(ObjectKind::StatefulSet, vec![]));
    store.apply(WatchEvent::Replaced(ObjectKind::Pod, vec![]));
    assert!(store.get_component("c1").is_none());
    assert_eq!(store.component_status("c1"), ComponentStatus::Closed);
}

async fn until_ready(store: &Store) {
    while !store.ready() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn bursts_beyond_capacity_lose_no_events() {
    let store = Arc::new(Store::new());
    let (tx, handle) = spawn_ingest(store.clone(), 4);

    for i in 0..8 {
        tx.send(WatchEvent::Applied(pod_for(&format!("c{i}"), &format!("p{i}"), "1"))).await.unwrap();
    }
    for kind in ObjectKind::REQUIRED {
        tx.send(WatchEvent::Synced(kind)).await.unwrap();
    }
    until_ready(&store).await;
    let mut ids: Vec<String> = store.all_components().iter().map(|c| c.id().to_string()).collect();
    ids.sort();
    assert_eq!(ids, (0..8).map(|i| format!("c{i}")).collect::<Vec<_>>());

    for i in 0..8 {
        tx.send(WatchEvent::Deleted(pod_for(&format!("c{i}"), &format!("p{i}"), "2"))).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();
    assert!(store.all_components().is_empty());
}
