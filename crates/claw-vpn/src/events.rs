//! Typed publish/subscribe topics.
//!
//! Each topic is a bounded broadcast channel. Publishing never waits for
//! subscribers; a subscriber that falls behind skips the oldest events.

use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Interface, Peer, RoutingTableInfo, User};

const TOPIC_CAPACITY: usize = 256;

/// One event topic carrying values of type `T`.
#[derive(Debug)]
pub struct Topic<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Creates a topic.
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { name, tx }
    }

    /// Topic name, used in logs.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Publishes an event.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Runs `handler` for every event until `token` is cancelled.
    ///
    /// Events are handled one at a time in publish order.
    pub fn spawn_handler<F, Fut>(&self, token: CancellationToken, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut rx = self.subscribe();
        let name = self.name;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => handler(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = name, skipped, "subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(topic = name, "event handler stopped");
        })
    }
}

/// All engine topics.
#[derive(Debug, Clone)]
pub struct EventBus {
    /// An interface was created.
    pub interface_created: Topic<Interface>,
    /// An interface was saved.
    pub interface_updated: Topic<Interface>,
    /// An interface was deleted.
    pub interface_deleted: Topic<Interface>,
    /// A peer was created.
    pub peer_created: Topic<Peer>,
    /// A peer was saved.
    pub peer_updated: Topic<Peer>,
    /// A peer was deleted.
    pub peer_deleted: Topic<Peer>,
    /// Policy routes of an interface need a refresh.
    pub route_update: Topic<RoutingTableInfo>,
    /// Policy rules of an interface must be removed.
    pub route_remove: Topic<RoutingTableInfo>,
    /// A user was created.
    pub user_created: Topic<User>,
}

impl EventBus {
    /// Creates a bus with empty topics.
    pub fn new() -> Self {
        Self {
            interface_created: Topic::new("interface.created"),
            interface_updated: Topic::new("interface.updated"),
            interface_deleted: Topic::new("interface.deleted"),
            peer_created: Topic::new("peer.created"),
            peer_updated: Topic::new("peer.updated"),
            peer_deleted: Topic::new("peer.deleted"),
            route_update: Topic::new("route.update"),
            route_remove: Topic::new("route.remove"),
            user_created: Topic::new("user.created"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
