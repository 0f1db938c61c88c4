//! Tenant authorization gate.
//!
//! A user may act on a resource only if the user's tenant is the resource's
//! tenant or one of its ancestors, and the resource's tenant is active. A
//! resource that does not exist is reported exactly like one the user may not
//! see: both yield `false`.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use edgepurge_core::{DeliveryServiceId, TenantId, UserId};

/// Resource whose owning tenant decides access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    DeliveryServiceId(DeliveryServiceId),
    DeliveryServiceName(String),
    UserId(UserId),
    Username(String),
}

impl core::fmt::Display for AuthTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthTarget::DeliveryServiceId(id) => write!(f, "deliveryservice #{id}"),
            AuthTarget::DeliveryServiceName(name) => write!(f, "deliveryservice '{name}'"),
            AuthTarget::UserId(id) => write!(f, "user #{id}"),
            AuthTarget::Username(name) => write!(f, "user '{name}'"),
        }
    }
}

/// Store-side lookups the gate needs.
#[async_trait]
pub trait TenantDirectory: Send {
    type Error: Send;

    /// Tenant owning `target`, or `None` if the target does not exist.
    async fn owning_tenant(&mut self, target: &AuthTarget) -> Result<Option<TenantId>, Self::Error>;

    /// `Some(active)` when `target` is `acting` or one of its descendants.
    async fn tenant_in_subtree(
        &mut self,
        acting: TenantId,
        target: TenantId,
    ) -> Result<Option<bool>, Self::Error>;
}

/// Decide whether a user of tenant `acting` may operate on `target`.
///
/// Errors are reserved for store failures and must abort the request.
pub async fn authorize_target<D>(
    directory: &mut D,
    acting: TenantId,
    target: &AuthTarget,
) -> Result<bool, D::Error>
where
    D: TenantDirectory + ?Sized,
{
    let Some(owner) = directory.owning_tenant(target).await? else {
        tracing::debug!(%target, "authorization target does not exist");
        return Ok(false);
    };

    let allowed = matches!(directory.tenant_in_subtree(acting, owner).await?, Some(true));
    if !allowed {
        tracing::debug!(%target, acting = %acting, owner = %owner, "tenant not authorized");
    }
    Ok(allowed)
}

/// A tenant and its place in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantNode {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<TenantId>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// In-memory tenant tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TenantNode>", into = "Vec<TenantNode>")]
pub struct TenantHierarchy {
    nodes: BTreeMap<TenantId, TenantNode>,
}

impl TenantHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: TenantNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: TenantId) -> Option<&TenantNode> {
        self.nodes.get(&id)
    }

    /// Whether `ancestor` is `tenant` itself or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: TenantId, tenant: TenantId) -> bool {
        let mut current = Some(tenant);
        // Bounded by the node count so a corrupt parent cycle cannot spin forever.
        for _ in 0..=self.nodes.len() {
            match current {
                Some(id) if id == ancestor => return self.nodes.contains_key(&id),
                Some(id) => current = self.nodes.get(&id).and_then(|n| n.parent),
                None => return false,
            }
        }
        false
    }

    pub fn subtree_status(&self, acting: TenantId, target: TenantId) -> Option<bool> {
        if self.is_ancestor_or_self(acting, target) {
            self.nodes.get(&target).map(|n| n.active)
        } else {
            None
        }
    }

    /// `acting` and all of its descendants.
    pub fn descendants_or_self(&self, acting: TenantId) -> BTreeSet<TenantId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.is_ancestor_or_self(acting, *id))
            .collect()
    }
}

impl From<Vec<TenantNode>> for TenantHierarchy {
    fn from(nodes: Vec<TenantNode>) -> Self {
        let mut tree = TenantHierarchy::new();
        for node in nodes {
            tree.insert(node);
        }
        tree
    }
}

impl From<TenantHierarchy> for Vec<TenantNode> {
    fn from(tree: TenantHierarchy) -> Self {
        tree.nodes.into_values().collect()
    }
}
