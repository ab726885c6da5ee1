#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use milvop_components::CHECKSUM_ANNOTATION;
use milvop_core::{ComponentSpec, MilvusCluster, MilvusClusterSpec, ProxySpec, Role};
use milvop_kubehub::{ListFilter, ResourceStore};
use milvop_reconcile::{ClusterReconciler, Outcome, ReconcileError};
use milvop_runner::{BoundedRunner, SequentialRunner};
use milvop_store::{MemStore, Op};
use serde_json::json;

fn demo() -> MilvusCluster {
    let mut mc = MilvusCluster::new("demo", MilvusClusterSpec::default());
    mc.metadata.namespace = Some("ns".into());
    mc.metadata.uid = Some("0b9f4c52-7a43-4d8e-9a38-5d2f0e6c1a77".into());
    mc.spec.dependencies.etcd.endpoints = vec!["etcd:2379".into()];
    mc
}

fn reconciler(store: &Arc<MemStore>) -> ClusterReconciler<MemStore, SequentialRunner> {
    ClusterReconciler::new(store.clone(), Arc::new(SequentialRunner)).unwrap()
}

async fn checksum_of(store: &MemStore, name: &str) -> String {
    let d: Deployment = store.get("ns", name).await.unwrap().unwrap();
    d.spec.unwrap().template.metadata.unwrap().annotations.unwrap()[CHECKSUM_ANNOTATION].clone()
}

#[tokio::test]
async fn first_pass_creates_every_child_second_pass_writes_nothing() {
    let store = Arc::new(MemStore::new());
    let r = ClusterReconciler::new(store.clone(), Arc::new(BoundedRunner::new(4))).unwrap();
    let mc = demo();

    r.reconcile(&mc).await.unwrap();
    assert_eq!(store.creates(), 1 + 8 + 8);
    let deployments: Vec<Deployment> = store.list(&ListFilter::namespaced("ns")).await.unwrap();
    let services: Vec<Service> = store.list(&ListFilter::namespaced("ns")).await.unwrap();
    assert_eq!(deployments.len(), 8);
    assert_eq!(services.len(), 8);
    assert!(services.iter().any(|s| s.metadata.name.as_deref() == Some("demo-milvus")));

    r.reconcile(&mc).await.unwrap();
    assert_eq!(store.updates(), 0);
    assert_eq!(store.creates(), 17);
}

#[tokio::test]
async fn config_map_create_update_noop() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    let mut mc = demo();

    assert_eq!(r.reconcile_config_map(&mc).await.unwrap(), Outcome::Created);
    assert_eq!(r.reconcile_config_map(&mc).await.unwrap(), Outcome::Unchanged);

    mc.spec.config.insert("log".into(), json!({ "level": "debug" }));
    assert_eq!(r.reconcile_config_map(&mc).await.unwrap(), Outcome::Updated);
    let cm: ConfigMap = store.get("ns", "demo-milvus").await.unwrap().unwrap();
    assert!(cm.data.unwrap()["milvus.yaml"].contains("debug"));
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn config_change_rolls_every_deployment() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    let mut mc = demo();
    r.reconcile(&mc).await.unwrap();
    let before = checksum_of(&store, "demo-milvus-querynode").await;

    mc.spec.config.insert("queryNode".into(), json!({ "gracefulTime": 10 }));
    r.reconcile(&mc).await.unwrap();
    // the config map plus one deployment per role; services are untouched
    assert_eq!(store.updates(), 1 + 8);
    assert_ne!(checksum_of(&store, "demo-milvus-querynode").await, before);
}

#[tokio::test]
async fn owned_fields_are_applied_and_foreign_ones_kept() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    let mut mc = demo();
    r.reconcile(&mc).await.unwrap();

    let mut live: Deployment = store.get("ns", "demo-milvus-datanode").await.unwrap().unwrap();
    live.metadata.labels.get_or_insert_with(Default::default).insert("team".into(), "search".into());
    store.update(&live).await.unwrap();

    mc.spec.components.data_node = Some(ComponentSpec { replicas: Some(3), ..Default::default() });
    let dn = *r.registry().get(Role::DataNode).unwrap();
    assert_eq!(r.reconcile_deployment(&mc, &dn).await.unwrap(), Outcome::Updated);

    let after: Deployment = store.get("ns", "demo-milvus-datanode").await.unwrap().unwrap();
    assert_eq!(after.metadata.labels.unwrap()["team"], "search");
    assert_eq!(after.spec.unwrap().replicas, Some(3));
    assert_eq!(r.reconcile_service(&mc, &dn).await.unwrap(), Outcome::Unchanged);
}

#[tokio::test]
async fn server_defaults_do_not_trigger_updates() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    let mut mc = demo();
    mc.spec.components.proxy = Some(ProxySpec { service_type: Some("LoadBalancer".into()), ..Default::default() });
    r.reconcile(&mc).await.unwrap();

    // what the API server fills in after admission
    let mut live: Deployment = store.get("ns", "demo-milvus-rootcoord").await.unwrap().unwrap();
    let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
    pod.volumes.as_mut().unwrap()[0].config_map.as_mut().unwrap().default_mode = Some(420);
    store.update(&live).await.unwrap();

    let mut svc: Service = store.get("ns", "demo-milvus").await.unwrap().unwrap();
    for (i, port) in svc.spec.as_mut().unwrap().ports.as_mut().unwrap().iter_mut().enumerate() {
        port.node_port = Some(30000 + i as i32);
    }
    store.update(&svc).await.unwrap();
    let writes = store.writes();

    let rc = *r.registry().get(Role::RootCoord).unwrap();
    let proxy = *r.registry().get(Role::Proxy).unwrap();
    assert_eq!(r.reconcile_deployment(&mc, &rc).await.unwrap(), Outcome::Unchanged);
    assert_eq!(r.reconcile_service(&mc, &proxy).await.unwrap(), Outcome::Unchanged);
    r.reconcile(&mc).await.unwrap();
    assert_eq!(store.writes(), writes);

    let svc: Service = store.get("ns", "demo-milvus").await.unwrap().unwrap();
    assert_eq!(svc.spec.unwrap().ports.unwrap()[0].node_port, Some(30000));
}

#[tokio::test]
async fn partial_failures_still_reconcile_the_other_roles() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    store.fail_next(Op::Create, 1);

    match r.reconcile_components(&demo()).await {
        Err(ReconcileError::Batch(e)) => assert_eq!((e.total, e.failed()), (8, 1)),
        other => panic!("expected batch error, got {other:?}"),
    }
    // root coordinator failed before its service; every other role got both
    assert_eq!(store.creates(), 14);
}

#[tokio::test]
async fn read_errors_abort_the_config_map_step() {
    let store = Arc::new(MemStore::new());
    let r = reconciler(&store);
    store.fail_next(Op::Get, 1);
    assert!(matches!(r.reconcile(&demo()).await, Err(ReconcileError::Store { .. })));
    assert!(store.is_empty());
}
