//! Infrastructure layer: transactional stores and the invalidation job engine.

pub mod changelog;
pub mod jobs;
pub mod store;

#[cfg(test)]
mod integration_tests;
