use std::borrow::Cow;

use serde::{Deserialize, Serialize};

pub const JOBS_READ: &str = "jobs.read";
pub const JOBS_CREATE: &str = "jobs.create";
pub const JOBS_UPDATE: &str = "jobs.update";
pub const JOBS_DELETE: &str = "jobs.delete";

/// Permission identifier.
///
/// Opaque strings (e.g. "jobs.read"). The wildcard `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
