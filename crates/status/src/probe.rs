//! Health probes: one condition per dimension of a tracked cluster.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use milvop_components::ComponentRegistry;
use milvop_core::{ConditionStatus, MilvusCluster, MilvusCondition, Role};
use milvop_kubehub::ResourceStore;
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

const ETCD_PORT: u16 = 2379;
const PULSAR_PORT: u16 = 6650;
const STORAGE_PORT: u16 = 9000;

/// What a probe looks at. Each dimension owns one condition, keyed by
/// [`Dimension::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Role(Role),
    Etcd,
    Pulsar,
    Storage,
}

impl Dimension {
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Role(r) => r.name(),
            Dimension::Etcd => "etcd",
            Dimension::Pulsar => "pulsar",
            Dimension::Storage => "storage",
        }
    }

    /// Coordinators plus the external dependencies.
    pub fn defaults() -> Vec<Dimension> {
        Role::COORDINATORS
            .iter()
            .copied()
            .map(Dimension::Role)
            .chain([Dimension::Etcd, Dimension::Pulsar, Dimension::Storage])
            .collect()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Evaluates one dimension of a cluster. `Err` means the probe could not run;
/// an unhealthy dimension is an `Ok` condition with status `False`.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, dimension: &Dimension, cluster: &MilvusCluster) -> Result<MilvusCondition>;
}

/// Role dimensions are judged by the role's deployment, dependencies by a TCP
/// connect to their endpoint.
pub struct DeploymentProbe<S> {
    store: Arc<S>,
    registry: ComponentRegistry,
    timeout: Duration,
}

impl<S: ResourceStore> DeploymentProbe<S> {
    pub fn new(store: Arc<S>) -> Result<Self> {
        Ok(Self { store, registry: ComponentRegistry::milvus_cluster()?, timeout: DEFAULT_PROBE_TIMEOUT })
    }

    /// Connect timeout from `MILVOP_PROBE_TIMEOUT_MS`.
    pub fn from_env(store: Arc<S>) -> Result<Self> {
        let timeout = std::env::var("MILVOP_PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);
        Ok(Self::new(store)?.with_timeout(timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn probe_role(&self, role: Role, cluster: &MilvusCluster) -> Result<MilvusCondition> {
        let component = self.registry.get(role).ok_or_else(|| anyhow!("role {} is not part of the cluster topology", role))?;
        let ns = cluster.metadata.namespace.as_deref().context("cluster without namespace")?;
        let name = cluster.metadata.name.as_deref().context("cluster without name")?;
        let deploy_name = component.deployment_name(name);
        let found: Option<Deployment> = self
            .store
            .get(ns, &deploy_name)
            .await
            .with_context(|| format!("read deployment {}/{}", ns, deploy_name))?;
        let Some(deploy) = found else {
            return Ok(MilvusCondition::new(role.name(), ConditionStatus::False)
                .with_reason("DeploymentNotFound")
                .with_message(format!("deployment {} not found", deploy_name)));
        };
        let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = deploy.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        let cond = if desired == 0 {
            MilvusCondition::new(role.name(), ConditionStatus::False).with_reason("ScaledToZero")
        } else if ready < desired {
            MilvusCondition::new(role.name(), ConditionStatus::False).with_reason("DeploymentNotReady")
        } else {
            MilvusCondition::new(role.name(), ConditionStatus::True).with_reason("DeploymentReady")
        };
        Ok(cond.with_message(format!("{}/{} replicas ready", ready, desired)))
    }

    async fn probe_endpoints(&self, dimension: &Dimension, endpoints: &[String], default_port: u16) -> MilvusCondition {
        let name = dimension.name();
        let addrs: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(|e| host_port(e, default_port))
            .collect();
        if addrs.is_empty() {
            return MilvusCondition::new(name, ConditionStatus::False)
                .with_reason("EndpointNotConfigured")
                .with_message(format!("no {} endpoint configured", name));
        }
        let mut last_err = String::new();
        for addr in &addrs {
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(_)) => {
                    return MilvusCondition::new(name, ConditionStatus::True)
                        .with_reason("EndpointReachable")
                        .with_message(format!("{} reachable", addr));
                }
                Ok(Err(e)) => last_err = format!("{}: {}", addr, e),
                Err(_) => last_err = format!("{}: timed out after {:?}", addr, self.timeout),
            }
            debug!(dimension = name, error = %last_err, "endpoint unreachable");
        }
        MilvusCondition::new(name, ConditionStatus::False).with_reason("EndpointUnreachable").with_message(last_err)
    }
}

#[async_trait::async_trait]
impl<S: ResourceStore> HealthProbe for DeploymentProbe<S> {
    async fn probe(&self, dimension: &Dimension, cluster: &MilvusCluster) -> Result<MilvusCondition> {
        let deps = &cluster.spec.dependencies;
        match dimension {
            Dimension::Role(role) => self.probe_role(*role, cluster).await,
            Dimension::Etcd => Ok(self.probe_endpoints(dimension, &deps.etcd.endpoints, ETCD_PORT).await),
            Dimension::Pulsar => {
                Ok(self.probe_endpoints(dimension, std::slice::from_ref(&deps.pulsar.endpoint), PULSAR_PORT).await)
            }
            Dimension::Storage => {
                Ok(self.probe_endpoints(dimension, std::slice::from_ref(&deps.storage.endpoint), STORAGE_PORT).await)
            }
        }
    }
}

/// `scheme://host:port/path` to `host:port`, adding the default port when
/// the endpoint carries none.
fn host_port(endpoint: &str, default_port: u16) -> String {
    let rest = endpoint.split_once("://").map(|(_, r)| r).unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default_port)
    }
}
