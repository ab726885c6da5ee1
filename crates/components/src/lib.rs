//! Milvus component model: the role registry, effective per-role settings and
//! the configuration checksum used to detect restart-inducing changes.

#![forbid(unsafe_code)]

pub mod checksum;
pub mod component;
pub mod registry;

pub use checksum::{cluster_checksum, restart_required, standalone_checksum, CHECKSUM_ANNOTATION};
pub use component::ComponentSource;
pub use registry::{Component, ComponentRegistry, RegistryError, METRIC_PATH, METRIC_PORT, METRIC_PORT_NAME};
