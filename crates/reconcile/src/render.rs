//! Desired child objects of a cluster, built from the resolved component model.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Service, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;
use milvop_components::component::{LABEL_INSTANCE, LABEL_NAME};
use milvop_components::Component;
use milvop_core::{ClusterDependencies, MilvusCluster, PRODUCT_NAME};
use serde_json::{json, Map, Value};

pub const CONFIG_FILE: &str = "milvus.yaml";
pub const CONFIG_VOLUME: &str = "milvus-config";
pub const CONFIG_MOUNT_PATH: &str = "/milvus/configs/milvus.yaml";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("cluster has no {0}")]
    MissingField(&'static str),
    #[error("render config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Name and namespace of a cluster, both required to render children.
pub fn cluster_ref(cluster: &MilvusCluster) -> Result<(&str, &str), RenderError> {
    let name = cluster.metadata.name.as_deref().ok_or(RenderError::MissingField("metadata.name"))?;
    let ns = cluster.metadata.namespace.as_deref().ok_or(RenderError::MissingField("metadata.namespace"))?;
    Ok((name, ns))
}

pub fn config_map_name(cluster: &str) -> String {
    format!("{}-{}", cluster, PRODUCT_NAME)
}

/// Labels shared by every child of a cluster.
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), PRODUCT_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), cluster.to_string()),
    ])
}

/// Inline config with the dependency endpoints written over it.
pub fn render_config(config: &Map<String, Value>, deps: &ClusterDependencies) -> Result<String, RenderError> {
    let mut conf = config.clone();
    overlay(&mut conf, "etcd", "endpoints", json!(deps.etcd.endpoints));
    if !deps.pulsar.endpoint.is_empty() {
        overlay(&mut conf, "pulsar", "address", json!(deps.pulsar.endpoint));
    }
    if !deps.storage.endpoint.is_empty() {
        overlay(&mut conf, "minio", "address", json!(deps.storage.endpoint));
    }
    Ok(serde_yaml::to_string(&conf)?)
}

fn overlay(conf: &mut Map<String, Value>, section: &str, key: &str, value: Value) {
    let entry = conf.entry(section.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Some(obj) = entry.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

fn child_meta(cluster: &MilvusCluster, name: String, labels: BTreeMap<String, String>) -> Result<ObjectMeta, RenderError> {
    let (_, ns) = cluster_ref(cluster)?;
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(ns.to_string()),
        labels: Some(labels),
        owner_references: cluster.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    })
}

pub fn config_map(cluster: &MilvusCluster) -> Result<ConfigMap, RenderError> {
    let (name, _) = cluster_ref(cluster)?;
    let body = render_config(&cluster.spec.config, &cluster.spec.dependencies)?;
    Ok(ConfigMap {
        metadata: child_meta(cluster, config_map_name(name), cluster_labels(name))?,
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), body)])),
        ..Default::default()
    })
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

pub fn deployment(cluster: &MilvusCluster, component: &Component) -> Result<Deployment, RenderError> {
    let (name, _) = cluster_ref(cluster)?;
    let spec = &cluster.spec;
    let labels = component.labels(name);

    let container = Container {
        name: component.container_name().to_string(),
        image: Some(component.image(spec)),
        image_pull_policy: Some(component.image_pull_policy(spec)),
        args: Some(component.container_args()),
        env: Some(component.env(spec)),
        ports: Some(component.container_ports(spec)),
        resources: Some(component.resources(spec)),
        liveness_probe: Some(component.liveness_probe()),
        readiness_probe: Some(component.readiness_probe()),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            sub_path: Some(CONFIG_FILE.to_string()),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let node_selector = component.node_selector(spec);

    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource { name: Some(config_map_name(name)), ..Default::default() }),
            ..Default::default()
        }]),
        tolerations: non_empty(component.tolerations(spec)),
        node_selector: (!node_selector.is_empty()).then_some(node_selector),
        image_pull_secrets: non_empty(component.image_pull_secrets(spec)),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: child_meta(cluster, component.deployment_name(name), labels.clone())?,
        spec: Some(DeploymentSpec {
            replicas: Some(component.replicas(spec)),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            strategy: Some(component.deployment_strategy()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(component.pod_annotations(spec)),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn service(cluster: &MilvusCluster, component: &Component) -> Result<Service, RenderError> {
    let (name, _) = cluster_ref(cluster)?;
    let spec = &cluster.spec;
    Ok(Service {
        metadata: child_meta(cluster, component.service_name(name), component.labels(name))?,
        spec: Some(ServiceSpec {
            type_: Some(component.service_type(spec)),
            ports: Some(component.service_ports(spec)),
            selector: Some(component.labels(name)),
            ..Default::default()
        }),
        ..Default::default()
    })
}
