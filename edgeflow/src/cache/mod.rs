//! Tenant-isolated smart cache with rule-driven invalidation.

mod rules;
mod store;

pub use rules::{InvalidationRules, KeyPattern};
pub use store::{CacheStats, SmartCache};
