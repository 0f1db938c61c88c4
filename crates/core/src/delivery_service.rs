//! Delivery service view consumed by the job engine.
//!
//! Only the fields the engine needs: identity, ownership, CDN membership and
//! the primary origin that scopes every asset URL.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CdnId, DeliveryServiceId, TenantId};
use crate::value_object::ValueObject;

/// Caller-facing reference to a delivery service: numeric id or `xmlId` short name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeliveryServiceRef {
    Id(DeliveryServiceId),
    Name(String),
}

impl DeliveryServiceRef {
    /// Whether this reference designates the given delivery service.
    pub fn refers_to(&self, ds: &DeliveryServiceInfo) -> bool {
        match self {
            DeliveryServiceRef::Id(id) => *id == ds.id,
            DeliveryServiceRef::Name(name) => *name == ds.xml_id,
        }
    }
}

impl core::fmt::Display for DeliveryServiceRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeliveryServiceRef::Id(id) => write!(f, "#{id}"),
            DeliveryServiceRef::Name(name) => f.write_str(name),
        }
    }
}

/// Primary upstream of a delivery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub protocol: String,
    pub fqdn: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ValueObject for Origin {}

impl Origin {
    /// `scheme://fqdn[:port]`, the prefix every asset URL must carry.
    pub fn url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.protocol, self.fqdn, port),
            None => format!("{}://{}", self.protocol, self.fqdn),
        }
    }

    /// Compose an asset URL from a caller-supplied path fragment or full URL.
    ///
    /// A fragment must start with `/` and is appended to the origin. A full URL is
    /// accepted verbatim only if it already lives under this origin.
    pub fn asset_url(&self, requested: &str) -> DomainResult<String> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(DomainError::validation("assetUrl: cannot be blank"));
        }
        if requested.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("assetUrl: cannot contain whitespace"));
        }

        let origin = self.url();
        if requested.starts_with('/') {
            return Ok(format!("{origin}{requested}"));
        }
        self.check_prefix(requested)?;
        Ok(requested.to_string())
    }

    /// Fail unless `asset_url` begins with this origin, ending on a host boundary.
    pub fn check_prefix(&self, asset_url: &str) -> DomainResult<()> {
        let origin = self.url();
        let under_origin = asset_url
            .strip_prefix(origin.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', ':']));
        if under_origin {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "Cannot set asset URL that does not start with Delivery Service origin URL: {origin}"
            )))
        }
    }
}

/// Resolved delivery service (collaborator lookup result).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryServiceInfo {
    pub id: DeliveryServiceId,
    pub xml_id: String,
    pub tenant_id: TenantId,
    pub cdn_id: CdnId,
    pub cdn_name: String,
    /// `None` when the delivery service has no primary origin configured.
    pub origin: Option<Origin>,
}

impl DeliveryServiceInfo {
    pub fn primary_origin(&self) -> DomainResult<&Origin> {
        self.origin.as_ref().ok_or_else(|| {
            DomainError::validation(format!(
                "Delivery Service '{}' has no primary origin",
                self.xml_id
            ))
        })
    }
}
