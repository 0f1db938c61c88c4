//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Origins and TTLs are compared by their attribute values; two origins with the
/// same scheme, host and port are the same origin regardless of which delivery
/// service row they were read from.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
