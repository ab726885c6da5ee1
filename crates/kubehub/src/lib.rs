//! Milvus operator kubehub: the resource store capability every reconciliation
//! and status write goes through, plus its kube-rs backed implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::Result;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Namespaced kinds the store can read and write.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} was modified concurrently")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Which objects a `list` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// `None` lists across all namespaces.
    pub namespace: Option<String>,
    /// Equality-based selector, e.g. `app=milvus,tier!=canary`.
    pub label_selector: Option<String>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), label_selector: None }
    }

    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Evaluate the label selector against a label map. Supports `k=v`, `k==v`,
    /// `k!=v`, `k` and `!k` terms joined by commas.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        let Some(sel) = self.label_selector.as_deref() else { return true };
        sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
    }

    pub fn matches_namespace(&self, ns: Option<&str>) -> bool {
        match self.namespace.as_deref() {
            Some(want) => ns == Some(want),
            None => true,
        }
    }
}

/// Minimal store capability. Reads of missing objects are `Ok(None)`.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;
    /// Replace the main resource; the status sub-resource is left alone.
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;
    async fn list<K: StoreObject>(&self, filter: &ListFilter) -> Result<Vec<K>, StoreError>;
    /// Replace the status sub-resource of `obj` with `obj.status`.
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;
}

/// `Kind namespace/name`, used in errors and log fields.
pub fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{} {}/{}",
        K::kind(&()),
        meta.namespace.as_deref().unwrap_or(""),
        meta.name.as_deref().unwrap_or("")
    )
}

fn name_and_namespace<K: Resource<DynamicType = ()>>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} without metadata.name", K::kind(&()))))?;
    let ns = meta
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Invalid(format!("{} {} without metadata.namespace", K::kind(&()), name)))?;
    Ok((name, ns))
}

/// Kube client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    info!("kube client initialized");
    Ok(client)
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn api<K: StoreObject>(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn classify(err: kube::Error, key: String) -> StoreError {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => StoreError::AlreadyExists(key),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(key),
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key),
        _ => StoreError::Kube(err),
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (_, ns) = name_and_namespace(obj)?;
        debug!(object = %object_key(obj), "create");
        counter!("store_writes", 1u64);
        self.api::<K>(&ns)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, object_key(obj)))
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (name, ns) = name_and_namespace(obj)?;
        debug!(object = %object_key(obj), "replace");
        counter!("store_writes", 1u64);
        self.api::<K>(&ns)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, object_key(obj)))
    }

    async fn list<K: StoreObject>(&self, filter: &ListFilter) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = match filter.namespace.as_deref() {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let mut lp = ListParams::default();
        if let Some(sel) = filter.label_selector.as_deref() {
            lp = lp.labels(sel);
        }
        Ok(api.list(&lp).await?.items)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (name, ns) = name_and_namespace(obj)?;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or(serde_json::Value::Null);
        debug!(object = %object_key(obj), "replace status");
        counter!("store_status_writes", 1u64);
        // A merge patch with the whole status replaces every field, conditions included.
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(&ns)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, object_key(obj)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selector_terms() {
        let l = labels(&[("app", "milvus"), ("tier", "prod")]);
        assert!(ListFilter::all().matches_labels(&l));
        assert!(ListFilter::all().with_labels("app=milvus").matches_labels(&l));
        assert!(ListFilter::all().with_labels("app==milvus, tier=prod").matches_labels(&l));
        assert!(!ListFilter::all().with_labels("app=milvus,tier=dev").matches_labels(&l));
        assert!(ListFilter::all().with_labels("tier!=dev").matches_labels(&l));
        assert!(!ListFilter::all().with_labels("tier!=prod").matches_labels(&l));
        assert!(ListFilter::all().with_labels("app").matches_labels(&l));
        assert!(!ListFilter::all().with_labels("!app").matches_labels(&l));
        assert!(ListFilter::all().with_labels("!canary").matches_labels(&l));
    }

    #[test]
    fn namespace_scope() {
        assert!(ListFilter::all().matches_namespace(Some("a")));
        assert!(ListFilter::namespaced("a").matches_namespace(Some("a")));
        assert!(!ListFilter::namespaced("a").matches_namespace(Some("b")));
        assert!(!ListFilter::namespaced("a").matches_namespace(None));
    }

    #[test]
    fn object_keys_name_the_kind() {
        use k8s_openapi::api::core::v1::ConfigMap;
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm1".into());
        cm.metadata.namespace = Some("ns".into());
        assert_eq!(object_key(&cm), "ConfigMap ns/cm1");
        assert_eq!(name_and_namespace(&cm).unwrap(), ("cm1".to_string(), "ns".to_string()));
        cm.metadata.namespace = None;
        assert!(matches!(name_and_namespace(&cm), Err(StoreError::Invalid(_))));
    }
}
