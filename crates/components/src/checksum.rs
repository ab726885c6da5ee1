//! Fingerprint of the configuration that changes runtime behaviour of the
//! managed processes: inline config plus dependency endpoints.

use milvop_core::{MilvusClusterSpec, MilvusSpec};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Pod template annotation carrying the checksum; a new value rolls the pods.
pub const CHECKSUM_ANNOTATION: &str = "milvus.io/config-checksum";

#[derive(Serialize)]
struct ChecksumInput<'a> {
    conf: Value,
    #[serde(rename = "etcd-endpoints")]
    etcd_endpoints: &'a [String],
    #[serde(rename = "pulsar-endpoint", skip_serializing_if = "Option::is_none")]
    pulsar_endpoint: Option<&'a str>,
    #[serde(rename = "storage-endpoint")]
    storage_endpoint: &'a str,
}

/// Checksum for a distributed cluster; includes the message bus endpoint.
pub fn cluster_checksum(spec: &MilvusClusterSpec) -> String {
    digest(&ChecksumInput {
        conf: canonical_map(&spec.config),
        etcd_endpoints: &spec.dependencies.etcd.endpoints,
        pulsar_endpoint: Some(&spec.dependencies.pulsar.endpoint),
        storage_endpoint: &spec.dependencies.storage.endpoint,
    })
}

/// Checksum for a standalone deployment, which has no message bus.
pub fn standalone_checksum(spec: &MilvusSpec) -> String {
    digest(&ChecksumInput {
        conf: canonical_map(&spec.config),
        etcd_endpoints: &spec.dependencies.etcd.endpoints,
        pulsar_endpoint: None,
        storage_endpoint: &spec.dependencies.storage.endpoint,
    })
}

/// True when a previously rolled-out checksum differs from the current one.
/// A missing previous value is a first rollout, not a restart.
pub fn restart_required(previous: Option<&str>, current: &str) -> bool {
    matches!(previous, Some(prev) if prev != current)
}

fn digest(input: &ChecksumInput<'_>) -> String {
    // Plain JSON values and strings always serialize.
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn canonical_map(map: &Map<String, Value>) -> Value {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), canonical(v))).collect())
}

// Rebuilds objects with sorted keys so the byte stream does not depend on
// insertion order, whichever map backs serde_json.
fn canonical(v: &Value) -> Value {
    match v {
        Value::Object(map) => canonical_map(map),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
