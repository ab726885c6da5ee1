//! Milvus reconcile: drives the children of a cluster (config map, one
//! deployment and one service per role) towards the rendered model.
//!
//! Every child follows the same shape: read it, create it when missing,
//! otherwise apply the owned fields onto the live object and write only if
//! that changed anything.

#![forbid(unsafe_code)]

pub mod render;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ServicePort, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use milvop_components::{restart_required, Component, ComponentRegistry, RegistryError, CHECKSUM_ANNOTATION};
use milvop_core::MilvusCluster;
use milvop_kubehub::{object_key, ResourceStore, StoreError, StoreObject};
use milvop_runner::{GroupError, GroupRunner};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub use render::RenderError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Batch(#[from] GroupError),
}

/// What a reconcile step did to one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Leaf-level differences between `target` and `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

pub struct ClusterReconciler<S, R> {
    store: Arc<S>,
    runner: Arc<R>,
    registry: ComponentRegistry,
}

impl<S, R> ClusterReconciler<S, R>
where
    S: ResourceStore,
    R: GroupRunner,
{
    pub fn new(store: Arc<S>, runner: Arc<R>) -> Result<Self, ReconcileError> {
        Ok(Self { store, runner, registry: ComponentRegistry::milvus_cluster()? })
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Config map first so new pods find their config, then every role.
    pub async fn reconcile(&self, cluster: &MilvusCluster) -> Result<(), ReconcileError> {
        self.reconcile_config_map(cluster).await?;
        self.reconcile_components(cluster).await
    }

    pub async fn reconcile_config_map(&self, cluster: &MilvusCluster) -> Result<Outcome, ReconcileError> {
        let desired = render::config_map(cluster)?;
        self.apply(desired, |cur, want| {
            merge_meta(&mut cur.metadata, &want.metadata);
            cur.data = want.data.clone();
        })
        .await
    }

    /// Deployment and service of every role, fanned out over the runner.
    pub async fn reconcile_components(&self, cluster: &MilvusCluster) -> Result<(), ReconcileError> {
        let components: Vec<Component> = self.registry.components().copied().collect();
        let shared = (self, cluster);
        self.runner
            .run_diff_args(
                |shared, component| {
                    let (this, cluster) = *shared;
                    async move {
                        this.reconcile_deployment(cluster, &component).await?;
                        this.reconcile_service(cluster, &component).await?;
                        Ok::<(), anyhow::Error>(())
                    }
                },
                &shared,
                components,
            )
            .await?;
        Ok(())
    }

    pub async fn reconcile_deployment(&self, cluster: &MilvusCluster, component: &Component) -> Result<Outcome, ReconcileError> {
        let desired = render::deployment(cluster, component)?;
        let role = component.name();
        self.apply(desired, |cur, want| {
            if let (Some(prev), Some(next)) = (pod_checksum(cur), pod_checksum(want)) {
                if restart_required(Some(prev), next) {
                    info!(deployment = %object_key(&*cur), role, "config changed, pods will restart");
                }
            }
            merge_deployment(cur, want);
        })
        .await
    }

    pub async fn reconcile_service(&self, cluster: &MilvusCluster, component: &Component) -> Result<Outcome, ReconcileError> {
        let desired = render::service(cluster, component)?;
        self.apply(desired, |cur, want| {
            merge_meta(&mut cur.metadata, &want.metadata);
            match (cur.spec.as_mut(), want.spec.as_ref()) {
                (Some(c), Some(w)) => {
                    c.type_ = w.type_.clone();
                    c.ports = w.ports.clone().map(|ports| keep_node_ports(ports, c.ports.as_deref()));
                    c.selector = w.selector.clone();
                }
                (None, w) => cur.spec = w.cloned(),
                _ => {}
            }
        })
        .await
    }

    /// Create `desired` when missing; otherwise run `merge` over a copy of
    /// the live object and update when the copy differs.
    async fn apply<K, M>(&self, desired: K, merge: M) -> Result<Outcome, ReconcileError>
    where
        K: StoreObject + PartialEq,
        M: FnOnce(&mut K, &K) + Send,
    {
        let key = object_key(&desired);
        let store_err = |source| ReconcileError::Store { key: key.clone(), source };
        let meta = desired.meta();
        let (ns, name) = (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default());

        let Some(existing) = self.store.get::<K>(&ns, &name).await.map_err(store_err)? else {
            self.store.create(&desired).await.map_err(store_err)?;
            counter!("reconcile_creates", 1u64);
            info!(object = %key, "created");
            return Ok(Outcome::Created);
        };

        let mut next = existing.clone();
        merge(&mut next, &desired);
        if next == existing {
            return Ok(Outcome::Unchanged);
        }
        if let (Ok(a), Ok(b)) = (serde_json::to_value(&next), serde_json::to_value(&existing)) {
            let d = diff_summary(&a, &b);
            debug!(object = %key, adds = d.adds, updates = d.updates, removes = d.removes, "updating");
        }
        self.store.update(&next).await.map_err(store_err)?;
        counter!("reconcile_updates", 1u64);
        info!(object = %key, "updated");
        Ok(Outcome::Updated)
    }
}

fn pod_checksum(d: &Deployment) -> Option<&str> {
    d.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CHECKSUM_ANNOTATION)
        .map(String::as_str)
}

/// Owned labels and annotations are merged in; foreign keys survive.
fn merge_meta(cur: &mut ObjectMeta, want: &ObjectMeta) {
    if let Some(labels) = &want.labels {
        cur.labels.get_or_insert_with(Default::default).extend(labels.clone());
    }
    if let Some(annotations) = &want.annotations {
        cur.annotations.get_or_insert_with(Default::default).extend(annotations.clone());
    }
    if want.owner_references.is_some() {
        cur.owner_references = want.owner_references.clone();
    }
}

// Node ports are allocated by the API server; carry them over by port name.
fn keep_node_ports(mut ports: Vec<ServicePort>, live: Option<&[ServicePort]>) -> Vec<ServicePort> {
    let live = live.unwrap_or_default();
    for p in ports.iter_mut().filter(|p| p.node_port.is_none()) {
        p.node_port = live.iter().find(|l| l.name == p.name).and_then(|l| l.node_port);
    }
    ports
}

// The API server fills in `defaultMode` on config map volumes.
fn keep_default_modes(mut volumes: Vec<Volume>, live: Option<&[Volume]>) -> Vec<Volume> {
    let live = live.unwrap_or_default();
    for v in &mut volumes {
        let Some(cm) = v.config_map.as_mut() else { continue };
        if cm.default_mode.is_some() {
            continue;
        }
        cm.default_mode = live
            .iter()
            .find(|l| l.name == v.name)
            .and_then(|l| l.config_map.as_ref())
            .and_then(|l| l.default_mode);
    }
    volumes
}

fn merge_container(cur: &mut Container, want: &Container) {
    cur.image = want.image.clone();
    cur.image_pull_policy = want.image_pull_policy.clone();
    cur.args = want.args.clone();
    cur.env = want.env.clone();
    cur.ports = want.ports.clone();
    cur.resources = want.resources.clone();
    cur.liveness_probe = want.liveness_probe.clone();
    cur.readiness_probe = want.readiness_probe.clone();
    cur.volume_mounts = want.volume_mounts.clone();
}

// The selector is immutable once created and is left as found.
fn merge_deployment(cur: &mut Deployment, want: &Deployment) {
    merge_meta(&mut cur.metadata, &want.metadata);
    let Some(w) = want.spec.as_ref() else { return };
    let Some(c) = cur.spec.as_mut() else {
        cur.spec = Some(w.clone());
        return;
    };
    c.replicas = w.replicas;
    c.strategy = w.strategy.clone();
    if let Some(wm) = &w.template.metadata {
        merge_meta(c.template.metadata.get_or_insert_with(Default::default), wm);
    }
    let Some(wp) = w.template.spec.as_ref() else { return };
    let Some(cp) = c.template.spec.as_mut() else {
        c.template.spec = Some(wp.clone());
        return;
    };
    for want_c in &wp.containers {
        match cp.containers.iter_mut().find(|x| x.name == want_c.name) {
            Some(cur_c) => merge_container(cur_c, want_c),
            None => cp.containers.push(want_c.clone()),
        }
    }
    cp.volumes = wp.volumes.clone().map(|vols| keep_default_modes(vols, cp.volumes.as_deref()));
    cp.tolerations = wp.tolerations.clone();
    cp.node_selector = wp.node_selector.clone();
    cp.image_pull_secrets = wp.image_pull_secrets.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "c": 2, "d": 3 }, "e": [1, 2] });
        let target = json!({ "a": 1, "b": { "c": 5, "f": 1 }, "e": [1, 3, 4], "g": true });
        let d = diff_summary(&target, &base);
        assert_eq!(d, DiffSummary { adds: 3, updates: 2, removes: 1 });
    }

    #[test]
    fn allocated_node_ports_survive_the_merge() {
        let live = vec![ServicePort { name: Some("milvus".into()), port: 19530, node_port: Some(31530), ..Default::default() }];
        let want = vec![
            ServicePort { name: Some("milvus".into()), port: 19530, ..Default::default() },
            ServicePort { name: Some("metrics".into()), port: 9091, ..Default::default() },
        ];
        let merged = keep_node_ports(want, Some(&live));
        assert_eq!(merged[0].node_port, Some(31530));
        assert_eq!(merged[1].node_port, None);
    }

    #[test]
    fn merge_meta_keeps_foreign_keys() {
        let mut cur = ObjectMeta {
            labels: Some([("team".to_string(), "search".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let want = ObjectMeta {
            labels: Some([("app.kubernetes.io/name".to_string(), "milvus".to_string())].into_iter().collect()),
            ..Default::default()
        };
        merge_meta(&mut cur, &want);
        let labels = cur.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["team"], "search");
    }
}
