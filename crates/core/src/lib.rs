//! Milvus operator core types: the `MilvusCluster` / `Milvus` custom resources,
//! the role topology and the status record owned by the status syncer.

#![forbid(unsafe_code)]

pub mod status;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{EnvVar, LocalObjectReference, ResourceRequirements, Toleration};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub use status::{ClusterPhase, ConditionSet, ConditionStatus, MilvusCondition, MilvusStatus};

/// Product segment used in every child object name.
pub const PRODUCT_NAME: &str = "milvus";

/// One named member of the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    RootCoord,
    DataCoord,
    QueryCoord,
    IndexCoord,
    DataNode,
    QueryNode,
    IndexNode,
    Proxy,
    /// Single-process deployment carrying every role.
    #[serde(rename = "milvus")]
    Standalone,
}

impl Role {
    /// Roles making up a distributed cluster, in reconciliation order.
    pub const CLUSTER: [Role; 8] = [
        Role::RootCoord,
        Role::DataCoord,
        Role::QueryCoord,
        Role::IndexCoord,
        Role::DataNode,
        Role::QueryNode,
        Role::IndexNode,
        Role::Proxy,
    ];

    pub const COORDINATORS: [Role; 4] = [Role::RootCoord, Role::DataCoord, Role::QueryCoord, Role::IndexCoord];

    /// The only role reachable from outside the cluster.
    pub const GATEWAY: Role = Role::Proxy;

    pub fn name(self) -> &'static str {
        match self {
            Role::RootCoord => "rootcoord",
            Role::DataCoord => "datacoord",
            Role::QueryCoord => "querycoord",
            Role::IndexCoord => "indexcoord",
            Role::DataNode => "datanode",
            Role::QueryNode => "querynode",
            Role::IndexNode => "indexnode",
            Role::Proxy => "proxy",
            Role::Standalone => PRODUCT_NAME,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::CLUSTER
            .iter()
            .chain(std::iter::once(&Role::Standalone))
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Overridable settings of a component. Used both as the cluster-wide common
/// block and as the per-role block; unset fields fall through to the next level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    /// Kubernetes service type of the externally reachable service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

/// Common component settings plus optional per-role overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilvusComponents {
    #[serde(flatten)]
    pub common: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_coord: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_coord: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_coord: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_coord: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_node: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdDependency {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDependency {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDependencies {
    #[serde(default)]
    pub etcd: EtcdDependency,
    #[serde(default)]
    pub pulsar: EndpointDependency,
    #[serde(default)]
    pub storage: EndpointDependency,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneDependencies {
    #[serde(default)]
    pub etcd: EtcdDependency,
    #[serde(default)]
    pub storage: EndpointDependency,
}

/// Desired state of a distributed Milvus cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "milvus.io",
    version = "v1alpha1",
    kind = "MilvusCluster",
    namespaced,
    status = "MilvusStatus",
    shortname = "mc",
    derive = "PartialEq",
    schema = "disabled",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MilvusClusterSpec {
    #[serde(default)]
    pub components: MilvusComponents,
    #[serde(default)]
    pub dependencies: ClusterDependencies,
    /// Inline configuration rendered into the component config map.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Desired state of a standalone Milvus deployment.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "milvus.io",
    version = "v1alpha1",
    kind = "Milvus",
    namespaced,
    status = "MilvusStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MilvusSpec {
    #[serde(default)]
    pub components: ComponentSpec,
    #[serde(default)]
    pub dependencies: StandaloneDependencies,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl MilvusCluster {
    /// Current phase; an instance without a status record is still being created.
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn is_healthy(&self) -> bool {
        self.phase() == ClusterPhase::Healthy
    }

    /// `namespace/name` for log fields.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or("")
        )
    }
}

pub mod prelude {
    pub use super::{
        ClusterDependencies, ClusterPhase, ComponentSpec, ConditionSet, ConditionStatus, MilvusCluster,
        MilvusClusterSpec, MilvusComponents, MilvusCondition, MilvusStatus, ProxySpec, Role, PRODUCT_NAME,
    };
}
