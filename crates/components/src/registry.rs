//! Role registry: one descriptor per role, validated once at construction.

use std::collections::BTreeMap;
use std::fmt;

use milvop_core::{ComponentSpec, MilvusComponents, Role};

pub const METRIC_PORT_NAME: &str = "metrics";
pub const METRIC_PATH: &str = "/metrics";
pub const METRIC_PORT: i32 = 9091;

pub const ROOT_COORD_PORT: i32 = 53100;
pub const DATA_COORD_PORT: i32 = 13333;
pub const QUERY_COORD_PORT: i32 = 19531;
pub const INDEX_COORD_PORT: i32 = 31000;
pub const INDEX_NODE_PORT: i32 = 21121;
pub const QUERY_NODE_PORT: i32 = 21123;
pub const DATA_NODE_PORT: i32 = 21124;
pub const PROXY_PORT: i32 = 19530;
pub const STANDALONE_PORT: i32 = PROXY_PORT;

/// Strongly typed lookup of a role's override block inside the cluster spec.
pub type SpecField = fn(&MilvusComponents) -> Option<&ComponentSpec>;

/// Role descriptor. Resolution functions live in [`crate::component`].
#[derive(Clone, Copy)]
pub struct Component {
    pub role: Role,
    pub default_port: i32,
    /// `None` only for the standalone role, which has no per-role block.
    pub spec_field: Option<SpecField>,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("role", &self.role)
            .field("default_port", &self.default_port)
            .field("spec_field", &self.spec_field.is_some())
            .finish()
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role && self.default_port == other.default_port
    }
}

impl Component {
    pub fn new(role: Role, default_port: i32, spec_field: SpecField) -> Self {
        Self { role, default_port, spec_field: Some(spec_field) }
    }

    pub fn standalone() -> Self {
        Self { role: Role::Standalone, default_port: STANDALONE_PORT, spec_field: None }
    }

    pub fn name(&self) -> &'static str {
        self.role.name()
    }

    pub fn is_coordinator(&self) -> bool {
        self.name().ends_with("coord")
    }

    pub fn is_worker_node(&self) -> bool {
        self.name().ends_with("node")
    }

    /// Roles exposed under the cluster-wide service name.
    pub fn is_gateway(&self) -> bool {
        matches!(self.role, Role::Proxy | Role::Standalone)
    }

    /// Override block of this role, if the cluster sets one.
    pub fn role_spec<'s>(&self, components: &'s MilvusComponents) -> Option<&'s ComponentSpec> {
        self.spec_field.and_then(|field| field(components))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("role {0} has no descriptor")]
    Missing(Role),
    #[error("role {0} registered twice")]
    Duplicate(Role),
    #[error("role {0} has no spec accessor")]
    MissingAccessor(Role),
    #[error("role {0} is not part of this topology")]
    Unexpected(Role),
}

/// Validated, immutable role table.
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    by_role: BTreeMap<Role, Component>,
    order: Vec<Role>,
}

impl ComponentRegistry {
    /// Build a registry covering exactly `roles`. Every role must appear once
    /// and every non-standalone role must carry a spec accessor.
    pub fn from_descriptors(roles: &[Role], descriptors: Vec<Component>) -> Result<Self, RegistryError> {
        let mut by_role = BTreeMap::new();
        for d in descriptors {
            if !roles.contains(&d.role) {
                return Err(RegistryError::Unexpected(d.role));
            }
            if d.role != Role::Standalone && d.spec_field.is_none() {
                return Err(RegistryError::MissingAccessor(d.role));
            }
            if by_role.insert(d.role, d).is_some() {
                return Err(RegistryError::Duplicate(d.role));
            }
        }
        if let Some(missing) = roles.iter().find(|r| !by_role.contains_key(*r)) {
            return Err(RegistryError::Missing(*missing));
        }
        Ok(Self { by_role, order: roles.to_vec() })
    }

    /// The distributed topology: four coordinators, three worker nodes, proxy.
    pub fn milvus_cluster() -> Result<Self, RegistryError> {
        Self::from_descriptors(&Role::CLUSTER, cluster_descriptors())
    }

    pub fn standalone() -> Result<Self, RegistryError> {
        Self::from_descriptors(&[Role::Standalone], vec![Component::standalone()])
    }

    /// Descriptor of a registered role. Roles outside the topology are a
    /// programming error and yield `None`.
    pub fn get(&self, role: Role) -> Option<&Component> {
        self.by_role.get(&role)
    }

    /// Descriptors in topology order.
    pub fn components(&self) -> impl Iterator<Item = &Component> + '_ {
        self.order.iter().filter_map(|r| self.by_role.get(r))
    }

    pub fn roles(&self) -> &[Role] {
        &self.order
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &Component> + '_ {
        self.components().filter(|c| c.is_coordinator())
    }
}

fn cluster_descriptors() -> Vec<Component> {
    vec![
        Component::new(Role::RootCoord, ROOT_COORD_PORT, |c| c.root_coord.as_ref()),
        Component::new(Role::DataCoord, DATA_COORD_PORT, |c| c.data_coord.as_ref()),
        Component::new(Role::QueryCoord, QUERY_COORD_PORT, |c| c.query_coord.as_ref()),
        Component::new(Role::IndexCoord, INDEX_COORD_PORT, |c| c.index_coord.as_ref()),
        Component::new(Role::DataNode, DATA_NODE_PORT, |c| c.data_node.as_ref()),
        Component::new(Role::QueryNode, QUERY_NODE_PORT, |c| c.query_node.as_ref()),
        Component::new(Role::IndexNode, INDEX_NODE_PORT, |c| c.index_node.as_ref()),
        Component::new(Role::Proxy, PROXY_PORT, |c| c.proxy.as_ref().map(|p| &p.component)),
    ]
}
