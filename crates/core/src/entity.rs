//! Entity trait: identity that survives mutation.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Store-assigned identifier; never changes after creation.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;
}
