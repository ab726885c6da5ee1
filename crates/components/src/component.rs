//! Effective per-role settings: role override, then the cluster-wide common
//! block, then the built-in default.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, LocalObjectReference, Probe, ResourceFieldSelector,
    ResourceRequirements, ServicePort, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use milvop_core::{ComponentSpec, MilvusClusterSpec, MilvusSpec, Role, PRODUCT_NAME};

use crate::checksum::{cluster_checksum, standalone_checksum, CHECKSUM_ANNOTATION};
use crate::registry::{Component, METRIC_PORT, METRIC_PORT_NAME};

pub const DEFAULT_IMAGE: &str = "milvusdb/milvus:v2.0.0";
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";
pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

pub const CACHE_SIZE_ENV: &str = "CACHE_SIZE";
pub const HEALTH_PATH: &str = "/healthz";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// A spec whose components can be resolved: the common block plus, per role,
/// an optional override block.
pub trait ComponentSource {
    fn common(&self) -> &ComponentSpec;
    fn role_override(&self, component: &Component) -> Option<&ComponentSpec>;
    /// Fingerprint stamped on pod templates.
    fn config_checksum(&self) -> String;
}

impl ComponentSource for MilvusClusterSpec {
    fn common(&self) -> &ComponentSpec {
        &self.components.common
    }

    fn role_override(&self, component: &Component) -> Option<&ComponentSpec> {
        component.role_spec(&self.components)
    }

    fn config_checksum(&self) -> String {
        cluster_checksum(self)
    }
}

impl ComponentSource for MilvusSpec {
    fn common(&self) -> &ComponentSpec {
        &self.components
    }

    fn role_override(&self, _component: &Component) -> Option<&ComponentSpec> {
        None
    }

    fn config_checksum(&self) -> String {
        standalone_checksum(self)
    }
}

impl Component {
    // Override level first, then common. `pick` returns `None` when a level
    // leaves the attribute unset.
    fn resolve<'s, S, T>(&self, spec: &'s S, pick: impl Fn(&'s ComponentSpec) -> Option<T>) -> Option<T>
    where
        S: ComponentSource,
    {
        spec.role_override(self).and_then(&pick).or_else(|| pick(spec.common()))
    }

    pub fn image(&self, spec: &impl ComponentSource) -> String {
        self.resolve(spec, |c| c.image.clone().filter(|i| !i.is_empty()))
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    pub fn image_pull_policy(&self, spec: &impl ComponentSource) -> String {
        self.resolve(spec, |c| c.image_pull_policy.clone())
            .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string())
    }

    pub fn image_pull_secrets(&self, spec: &impl ComponentSource) -> Vec<LocalObjectReference> {
        self.resolve(spec, |c| non_empty(&c.image_pull_secrets)).unwrap_or_default()
    }

    pub fn tolerations(&self, spec: &impl ComponentSource) -> Vec<Toleration> {
        self.resolve(spec, |c| non_empty(&c.tolerations)).unwrap_or_default()
    }

    pub fn node_selector(&self, spec: &impl ComponentSource) -> BTreeMap<String, String> {
        self.resolve(spec, |c| c.node_selector.clone()).unwrap_or_default()
    }

    pub fn resources(&self, spec: &impl ComponentSource) -> ResourceRequirements {
        self.resolve(spec, |c| c.resources.clone()).unwrap_or_default()
    }

    pub fn replicas(&self, spec: &impl ComponentSource) -> i32 {
        self.resolve(spec, |c| c.replicas).unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn port(&self, spec: &impl ComponentSource) -> i32 {
        self.resolve(spec, |c| c.port.filter(|p| *p != 0)).unwrap_or(self.default_port)
    }

    /// Cache sizing hint first, then common entries, then role entries; a later
    /// level replaces an earlier entry of the same name in place.
    pub fn env(&self, spec: &impl ComponentSource) -> Vec<EnvVar> {
        let mut env = vec![cache_size_env()];
        merge_env(&mut env, &spec.common().env);
        if let Some(role) = spec.role_override(self) {
            merge_env(&mut env, &role.env);
        }
        env
    }

    pub fn instance_name(&self, cluster: &str) -> String {
        format!("{}-{}-{}", cluster, PRODUCT_NAME, self.name())
    }

    pub fn deployment_name(&self, cluster: &str) -> String {
        self.instance_name(cluster)
    }

    /// The gateway is reachable under the single cluster-wide name.
    pub fn service_name(&self, cluster: &str) -> String {
        if self.is_gateway() {
            format!("{}-{}", cluster, PRODUCT_NAME)
        } else {
            self.instance_name(cluster)
        }
    }

    pub fn container_name(&self) -> &'static str {
        self.name()
    }

    /// Arguments of the container entrypoint.
    pub fn container_args(&self) -> Vec<String> {
        let target = match self.role {
            Role::Standalone => "standalone",
            _ => self.name(),
        };
        vec![PRODUCT_NAME.to_string(), "run".to_string(), target.to_string()]
    }

    pub fn container_ports(&self, spec: &impl ComponentSource) -> Vec<ContainerPort> {
        vec![
            ContainerPort {
                name: Some(self.name().to_string()),
                container_port: self.port(spec),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some(METRIC_PORT_NAME.to_string()),
                container_port: METRIC_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]
    }

    /// Worker nodes are not load-balanced to directly, so their role port
    /// stays off the service.
    pub fn service_ports(&self, spec: &impl ComponentSource) -> Vec<ServicePort> {
        let mut ports = Vec::with_capacity(2);
        if !self.is_worker_node() {
            ports.push(ServicePort {
                name: Some(self.name().to_string()),
                protocol: Some("TCP".to_string()),
                port: self.port(spec),
                target_port: Some(IntOrString::String(self.name().to_string())),
                ..Default::default()
            });
        }
        ports.push(ServicePort {
            name: Some(METRIC_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            port: METRIC_PORT,
            target_port: Some(IntOrString::String(METRIC_PORT_NAME.to_string())),
            ..Default::default()
        });
        ports
    }

    pub fn service_type(&self, spec: &MilvusClusterSpec) -> String {
        let proxy_type = spec.components.proxy.as_ref().and_then(|p| p.service_type.clone());
        match (self.role, proxy_type) {
            (Role::Proxy, Some(t)) if !t.is_empty() => t,
            _ => DEFAULT_SERVICE_TYPE.to_string(),
        }
    }

    /// Coordinators may hold exclusive state, so two live replicas must never
    /// overlap; everything else rolls one surged replica at a time.
    pub fn deployment_strategy(&self) -> DeploymentStrategy {
        if self.is_coordinator() {
            return DeploymentStrategy { type_: Some("Recreate".to_string()), rolling_update: None };
        }
        DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::Int(0)),
                max_surge: Some(IntOrString::Int(1)),
            }),
        }
    }

    pub fn liveness_probe(&self) -> Probe {
        health_probe()
    }

    pub fn readiness_probe(&self) -> Probe {
        health_probe()
    }

    /// Labels identifying this role's pods; also the service selector.
    pub fn labels(&self, cluster: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), PRODUCT_NAME.to_string()),
            (LABEL_INSTANCE.to_string(), cluster.to_string()),
            (LABEL_COMPONENT.to_string(), self.name().to_string()),
        ])
    }

    pub fn pod_annotations(&self, spec: &impl ComponentSource) -> BTreeMap<String, String> {
        BTreeMap::from([(CHECKSUM_ANNOTATION.to_string(), spec.config_checksum())])
    }
}

fn non_empty<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    (!items.is_empty()).then(|| items.to_vec())
}

fn merge_env(env: &mut Vec<EnvVar>, overrides: &[EnvVar]) {
    for var in overrides {
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => env.push(var.clone()),
        }
    }
}

fn cache_size_env() -> EnvVar {
    EnvVar {
        name: CACHE_SIZE_ENV.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                divisor: Some(Quantity("1Gi".to_string())),
                resource: "limits.memory".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

// Cold starts can take minutes, hence the long initial delay.
fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(METRIC_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(120),
        timeout_seconds: Some(3),
        period_seconds: Some(30),
        failure_threshold: Some(2),
        success_threshold: Some(1),
        ..Default::default()
    }
}
