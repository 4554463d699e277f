//! In-flight request deduplication.

use crate::config::CoalescerConfig;
use crate::core::OperationKey;
use crate::errors::EdgeflowError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Key identifying coalescable calls. Always tenant-scoped.
pub type CoalesceKey = OperationKey;

/// What every caller of one coalesced call receives.
pub type SharedOutcome = Result<Arc<serde_json::Value>, EdgeflowError>;

enum Slot {
    Pending {
        // FIFO attach order; the leader is first
        subscribers: Vec<oneshot::Sender<SharedOutcome>>,
        started_at: Instant,
    },
    Resolved {
        outcome: SharedOutcome,
        resolved_at: Instant,
    },
}

impl Slot {
    fn pending(leader: oneshot::Sender<SharedOutcome>) -> Self {
        Self::Pending {
            subscribers: vec![leader],
            started_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Counters {
    leaders: AtomicU64,
    coalesced: AtomicU64,
    grace_hits: AtomicU64,
}

/// Point-in-time coalescer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerStats {
    /// Calls that actually ran the operation.
    pub leaders: u64,
    /// Calls that attached to a pending slot.
    pub coalesced: u64,
    /// Calls served from a just-resolved slot.
    pub grace_hits: u64,
    /// Keys currently running.
    pub in_flight: usize,
}

/// Deduplicates identical concurrent operations.
///
/// The first caller for a key becomes the leader; its operation runs on a
/// spawned task so dropping any caller, the leader included, never cancels
/// the shared work. Successful results keep serving new callers for the
/// grace window; failures are delivered to current subscribers only.
pub struct RequestCoalescer {
    slots: Arc<DashMap<CoalesceKey, Slot>>,
    grace_window: Duration,
    counters: Arc<Counters>,
}

impl RequestCoalescer {
    /// Creates a coalescer.
    #[must_use]
    pub fn new(grace_window: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            grace_window,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Creates a coalescer from configuration.
    #[must_use]
    pub fn from_config(config: &CoalescerConfig) -> Self {
        Self::new(config.grace_window())
    }

    /// Returns the grace window.
    #[must_use]
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Runs `operation` once for all concurrent callers with the same key.
    ///
    /// # Errors
    ///
    /// Every caller receives the operation's error. A panic inside the
    /// operation surfaces as an unknown error.
    pub async fn coalesce<F, Fut>(&self, key: CoalesceKey, operation: F) -> SharedOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EdgeflowError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leads = match self.slots.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::pending(tx));
                true
            }
            Entry::Occupied(mut occupied) => {
                let mut tx = Some(tx);
                match occupied.get_mut() {
                    Slot::Pending { subscribers, .. } => {
                        subscribers.extend(tx.take());
                    }
                    Slot::Resolved {
                        outcome,
                        resolved_at,
                    } => {
                        if resolved_at.elapsed() < self.grace_window {
                            self.counters.grace_hits.fetch_add(1, Ordering::Relaxed);
                            return outcome.clone();
                        }
                    }
                }
                match tx {
                    Some(tx) => {
                        occupied.insert(Slot::pending(tx));
                        true
                    }
                    None => false,
                }
            }
        };

        if leads {
            self.counters.leaders.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Coalescer leader started");
            self.spawn_leader(key, operation());
        } else {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Attached to in-flight operation");
        }

        rx.await.unwrap_or_else(|_| {
            Err(EdgeflowError::unknown(
                "coalesced operation ended without delivering a result",
            ))
        })
    }

    fn spawn_leader<Fut>(&self, key: CoalesceKey, work: Fut)
    where
        Fut: Future<Output = Result<serde_json::Value, EdgeflowError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let grace = self.grace_window;

        tokio::spawn(async move {
            let outcome: SharedOutcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(EdgeflowError::unknown(format!(
                    "operation '{}' panicked",
                    key.operation()
                ))),
            };

            let resolved_at = Instant::now();
            let keep = outcome.is_ok() && !grace.is_zero();

            let subscribers = if keep {
                let mut taken = Vec::new();
                if let Some(mut slot) = slots.get_mut(&key) {
                    if let Slot::Pending {
                        subscribers,
                        started_at,
                    } = &mut *slot
                    {
                        tracing::trace!(
                            key = %key,
                            elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                            "Coalesced operation resolved"
                        );
                        taken = std::mem::take(subscribers);
                    }
                    *slot = Slot::Resolved {
                        outcome: outcome.clone(),
                        resolved_at,
                    };
                }
                taken
            } else {
                match slots.remove(&key) {
                    Some((_, Slot::Pending { subscribers, .. })) => subscribers,
                    _ => Vec::new(),
                }
            };

            let waiting = subscribers.len();
            for tx in subscribers {
                // a dropped caller is not an error
                let _ = tx.send(outcome.clone());
            }
            if waiting > 1 {
                tracing::debug!(key = %key, callers = waiting, "Delivered coalesced result");
            }

            if keep {
                tokio::time::sleep(grace).await;
                slots.remove_if(&key, |_, slot| {
                    matches!(slot, Slot::Resolved { resolved_at: at, .. } if *at == resolved_at)
                });
            }
        });
    }

    /// Drops resolved slots whose key is `stale`, so the next caller runs
    /// the operation again instead of reusing a result a write superseded.
    /// Pending slots are left alone.
    pub fn forget_resolved<P>(&self, mut stale: P) -> usize
    where
        P: FnMut(&CoalesceKey) -> bool,
    {
        let before = self.slots.len();
        self.slots
            .retain(|key, slot| !(matches!(slot, Slot::Resolved { .. }) && stale(key)));
        let dropped = before.saturating_sub(self.slots.len());
        if dropped > 0 {
            tracing::trace!(dropped, "Forgot resolved coalescer slots");
        }
        dropped
    }

    /// Number of keys with an operation still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Pending { .. }))
            .count()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leaders: self.counters.leaders.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            grace_hits: self.counters.grace_hits.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::from_config(&CoalescerConfig::default())
    }
}

impl fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("grace_window", &self.grace_window)
            .field("slots", &self.slots.len())
            .finish()
    }
}
