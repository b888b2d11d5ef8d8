//! Fan-out of change notifications to subscribed clients.
//!
//! A subscriber endpoint is a capability handle: the connection's id
//! plus a bounded channel drained by that connection's writer task.
//! The registry never touches the transport directly, so unit tests
//! exercise it with bare channels.
//!
//! Delivery is best effort per recipient: each send gets a bounded
//! timeout, a failed or timed-out send evicts that subscriber
//! permanently, and no failure ever propagates to the mutating caller
//! or stalls delivery to the remaining subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Change, ServerMessage};

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub notifications_delivered: u64,
    pub subscribers_pruned: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters; read via [`SubscriberRegistry::stats`].
#[derive(Default)]
struct AtomicRegistryStats {
    delivered: AtomicU64,
    pruned: AtomicU64,
}

/// Registry of connected clients' notification endpoints.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<ServerMessage>>>,
    delivery_timeout: Duration,
    stats: AtomicRegistryStats,
}

impl SubscriberRegistry {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            delivery_timeout,
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Add an endpoint to the fan-out set.
    ///
    /// Re-registration under the same id is harmless; the newer
    /// channel wins.
    pub async fn register(&self, id: Uuid, endpoint: mpsc::Sender<ServerMessage>) {
        let mut subs = self.subscribers.write().await;
        subs.insert(id, endpoint);
        log::debug!("Subscriber {id} registered ({} total)", subs.len());
    }

    /// Remove an endpoint (clean disconnect).
    pub async fn remove(&self, id: &Uuid) -> bool {
        self.subscribers.write().await.remove(id).is_some()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver one change notification to every registered endpoint
    /// except the optionally-excluded originator.
    ///
    /// The recipient set is snapshotted up front, so a subscriber that
    /// registers mid-broadcast sees only later changes (its seed
    /// snapshot covers the rest). Returns the number of successful
    /// deliveries.
    pub async fn broadcast(&self, change: Change, except: Option<Uuid>) -> usize {
        let recipients: Vec<(Uuid, mpsc::Sender<ServerMessage>)> = {
            let subs = self.subscribers.read().await;
            subs.iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        if recipients.is_empty() {
            return 0;
        }

        let notify = ServerMessage::Notify { change };
        let deliveries = recipients.iter().map(|(id, tx)| {
            let msg = notify.clone();
            let deadline = self.delivery_timeout;
            async move {
                match tokio::time::timeout(deadline, tx.send(msg)).await {
                    Ok(Ok(())) => (*id, true),
                    Ok(Err(_)) => (*id, false),
                    Err(_) => (*id, false),
                }
            }
        });

        let results = futures_util::future::join_all(deliveries).await;

        let mut delivered = 0;
        let mut dead: Vec<Uuid> = Vec::new();
        for (id, ok) in results {
            if ok {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in &dead {
                if subs.remove(id).is_some() {
                    log::warn!("Subscriber {id} unreachable, pruned");
                    self.stats.pruned.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Snapshot of the fan-out counters.
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            notifications_delivered: self.stats.delivered.load(Ordering::Relaxed),
            subscribers_pruned: self.stats.pruned.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }
}
