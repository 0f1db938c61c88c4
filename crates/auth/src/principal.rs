use serde::{Deserialize, Serialize};

use edgepurge_core::{TenantId, UserId};

use crate::{Permission, Role};

/// The acting user of a request, as established by authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
    pub tenant_id: TenantId,
    pub roles: Vec<Role>,
}

impl Principal {
    /// Effective permissions: the union of what each role grants.
    pub fn permissions(&self) -> Vec<Permission> {
        let mut perms: Vec<Permission> = self.roles.iter().flat_map(Role::permissions).collect();
        perms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        perms.dedup();
        perms
    }
}
