//! `edgepurge-auth`: authentication and tenant authorization boundary.
//!
//! Decoupled from HTTP and from any particular store: tenant lookups go through
//! the [`TenantDirectory`] trait.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod tenancy;

pub use authorize::{AuthzError, authorize};
pub use claims::{Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError, validate_claims};
pub use permissions::Permission;
pub use principal::Principal;
pub use roles::Role;
pub use tenancy::{AuthTarget, TenantDirectory, TenantHierarchy, TenantNode, authorize_target};
