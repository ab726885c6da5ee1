#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::ConfigMap;
use milvop_core::{ClusterPhase, MilvusCluster, MilvusClusterSpec, MilvusStatus};
use milvop_kubehub::{ListFilter, ResourceStore, StoreError};
use milvop_store::{MemStore, Op};

fn cluster(ns: &str, name: &str, phase: Option<ClusterPhase>) -> MilvusCluster {
    let mut mc = MilvusCluster::new(name, MilvusClusterSpec::default());
    mc.metadata.namespace = Some(ns.into());
    mc.status = phase.map(|status| MilvusStatus { status, conditions: vec![] });
    mc
}

fn config_map(ns: &str, name: &str, labels: &[(&str, &str)]) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.into());
    cm.metadata.namespace = Some(ns.into());
    cm.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    cm
}

#[tokio::test]
async fn create_assigns_identity_and_rejects_duplicates() {
    let store = MemStore::new();
    let created = store.create(&config_map("ns", "a", &[])).await.unwrap();
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());
    assert_eq!(store.creates(), 1);

    let again = store.create(&config_map("ns", "a", &[])).await;
    assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
    assert_eq!(store.creates(), 1);

    let fetched: ConfigMap = store.get("ns", "a").await.unwrap().unwrap();
    assert_eq!(fetched.metadata.uid, created.metadata.uid);
    assert!(store.get::<ConfigMap>("ns", "missing").await.unwrap().is_none());
    assert!(store.get::<ConfigMap>("other", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn update_needs_existing_object_and_current_version() {
    let store = MemStore::new();
    assert!(matches!(store.update(&config_map("ns", "a", &[])).await, Err(StoreError::NotFound(_))));

    let mut cm = store.create(&config_map("ns", "a", &[])).await.unwrap();
    cm.data = Some([("k".to_string(), "v".to_string())].into_iter().collect());
    let updated = store.update(&cm).await.unwrap();
    assert_ne!(updated.metadata.resource_version, cm.metadata.resource_version);

    // the pre-update copy is now stale
    assert!(matches!(store.update(&cm).await, Err(StoreError::Conflict(_))));
    assert_eq!(store.updates(), 1);
}

#[tokio::test]
async fn update_leaves_status_alone_and_update_status_only_touches_status() {
    let store = MemStore::new();
    store.seed(&cluster("ns", "demo", Some(ClusterPhase::Healthy))).unwrap();

    let mut mc: MilvusCluster = store.get("ns", "demo").await.unwrap().unwrap();
    mc.spec.config.insert("log".into(), serde_json::json!({ "level": "debug" }));
    mc.status = Some(MilvusStatus { status: ClusterPhase::Unhealthy, conditions: vec![] });
    let after = store.update(&mc).await.unwrap();
    assert_eq!(after.phase(), ClusterPhase::Healthy);
    assert!(after.spec.config.contains_key("log"));

    let mut stale = cluster("ns", "demo", Some(ClusterPhase::Unhealthy));
    stale.spec.config.clear();
    let after = store.update_status(&stale).await.unwrap();
    assert_eq!(after.phase(), ClusterPhase::Unhealthy);
    assert!(after.spec.config.contains_key("log"));
    assert_eq!(store.status_updates(), 1);
    assert_eq!(store.writes(), 2);
}

#[tokio::test]
async fn list_filters_by_kind_namespace_and_labels() {
    let store = MemStore::new();
    store.seed(&config_map("a", "one", &[("app", "milvus")])).unwrap();
    store.seed(&config_map("a", "two", &[("app", "other")])).unwrap();
    store.seed(&config_map("b", "three", &[("app", "milvus")])).unwrap();
    store.seed(&cluster("a", "demo", None)).unwrap();

    let all: Vec<ConfigMap> = store.list(&ListFilter::all()).await.unwrap();
    assert_eq!(all.len(), 3);

    let in_a: Vec<ConfigMap> = store.list(&ListFilter::namespaced("a")).await.unwrap();
    let names: Vec<_> = in_a.iter().filter_map(|c| c.metadata.name.clone()).collect();
    assert_eq!(names, vec!["one", "two"]);

    let labeled: Vec<ConfigMap> = store.list(&ListFilter::all().with_labels("app=milvus")).await.unwrap();
    assert_eq!(labeled.len(), 2);

    let clusters: Vec<MilvusCluster> = store.list(&ListFilter::all()).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn injected_failures_are_consumed() {
    let store = MemStore::new();
    store.seed(&cluster("ns", "demo", None)).unwrap();
    store.fail_next(Op::List, 1);
    store.fail_next(Op::UpdateStatus, 2);

    assert!(matches!(store.list::<MilvusCluster>(&ListFilter::all()).await, Err(StoreError::Unavailable(_))));
    assert_eq!(store.list::<MilvusCluster>(&ListFilter::all()).await.unwrap().len(), 1);

    let mc = cluster("ns", "demo", Some(ClusterPhase::Healthy));
    assert!(store.update_status(&mc).await.is_err());
    assert!(store.update_status(&mc).await.is_err());
    assert!(store.update_status(&mc).await.is_ok());
    assert_eq!(store.status_updates(), 1);
}

#[tokio::test]
async fn objects_need_name_and_namespace() {
    let store = MemStore::new();
    let mut cm = config_map("ns", "a", &[]);
    cm.metadata.namespace = None;
    assert!(matches!(store.create(&cm).await, Err(StoreError::Invalid(_))));
    assert!(store.is_empty());
}
