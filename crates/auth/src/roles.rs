use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;
use crate::permissions;

/// Role identifier used for RBAC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: &'static str = "admin";
    pub const OPERATIONS: &'static str = "operations";
    pub const READ_ONLY: &'static str = "read-only";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Permissions granted by this role. Unknown roles grant nothing.
    pub fn permissions(&self) -> Vec<Permission> {
        match self.as_str() {
            Self::ADMIN => vec![Permission::new("*")],
            Self::OPERATIONS => vec![
                Permission::new(permissions::JOBS_READ),
                Permission::new(permissions::JOBS_CREATE),
                Permission::new(permissions::JOBS_UPDATE),
                Permission::new(permissions::JOBS_DELETE),
            ],
            Self::READ_ONLY => vec![Permission::new(permissions::JOBS_READ)],
            _ => Vec::new(),
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
