//! Request coalescing keyed by tenant, operation and parameter hash.

mod coalescer;

pub use coalescer::{CoalesceKey, CoalescerStats, RequestCoalescer, SharedOutcome};
