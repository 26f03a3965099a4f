//! # Notification Bus
//!
//! Delivers a [`Delta`] to interested parties after every table flush and view
//! refresh. Two delivery styles are offered:
//!
//! ```text
//!                       ┌──────────────────────────┐
//!  engine actor ──────► │     NotificationBus      │
//!   publish(&delta)     │                          │
//!                       │  callbacks[node] ────────┼──► Fn(&Delta)   (inline, on the actor thread)
//!                       │  broadcast::Sender ──────┼──► ChangeStream (async, filtered by node)
//!                       └──────────────────────────┘
//! ```
//!
//! ## Callbacks
//!
//! `subscribe(node, callback)` registers a closure that runs on the engine
//! thread right after the commit. Callbacks should be quick; anything heavy
//! belongs on a [`ChangeStream`]. A panicking callback is caught and logged,
//! and the remaining callbacks still run.
//!
//! Subscribing to an unknown node returns an inert [`Subscription`] that never
//! fires.
//!
//! ## Change Streams
//!
//! `watch(node)` hands out a receiver on a bounded `tokio::sync::broadcast`
//! channel shared by all watchers. A watcher that falls more than `capacity`
//! deltas behind gets [`Error::SubscriptionLagged`] with the number missed,
//! and continues from the oldest retained delta.
//!
//! ## Rust Concepts
//!
//! - **`Arc<dyn Fn(&Delta) + Send + Sync>`**: callbacks are shared, so they can
//!   be cloned out of the lock and invoked without holding it. A callback may
//!   therefore subscribe or unsubscribe without deadlocking.
//! - **`catch_unwind(AssertUnwindSafe(..))`**: turns a panic in user code into
//!   a value, keeping the engine thread alive.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Delta, NodeId};

/// Default capacity of the change-stream channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

type Callback = Arc<dyn Fn(&Delta) + Send + Sync>;

// =============================================================================
// Bus
// =============================================================================

struct BusInner {
    /// Nodes that currently exist; subscriptions to anything else are inert.
    registered: HashSet<NodeId>,
    callbacks: HashMap<NodeId, Vec<(u64, Callback)>>,
    next_id: u64,
    /// `None` once the bus is closed.
    sender: Option<broadcast::Sender<Delta>>,
}

/// Routes deltas to callbacks and change streams.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<Mutex<BusInner>>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("NotificationBus")
            .field("registered", &inner.registered.len())
            .field("callbacks", &inner.callbacks.values().map(Vec::len).sum::<usize>())
            .field("closed", &inner.sender.is_none())
            .finish()
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                registered: HashSet::new(),
                callbacks: HashMap::new(),
                next_id: 0,
                sender: Some(sender),
            })),
        }
    }

    // callbacks never run under the lock, so a poisoned guard is still consistent
    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `node` subscribable.
    pub fn register(&self, node: &NodeId) {
        self.lock().registered.insert(node.clone());
    }

    /// Forgets `node` and drops its callbacks.
    pub fn unregister(&self, node: &NodeId) {
        let mut inner = self.lock();
        inner.registered.remove(node.as_str());
        inner.callbacks.remove(node.as_str());
    }

    /// Registers a callback for `node`.
    pub fn subscribe<F>(&self, node: &NodeId, callback: F) -> Subscription
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        if inner.sender.is_none() || !inner.registered.contains(node.as_str()) {
            return Subscription::inert(node.clone());
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .callbacks
            .entry(node.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            node: node.clone(),
            id: Some(id),
            bus: Some(self.clone()),
        }
    }

    /// Opens a change stream for `node`.
    pub fn watch(&self, node: &NodeId) -> ChangeStream {
        let inner = self.lock();
        let receiver = match &inner.sender {
            Some(sender) if inner.registered.contains(node.as_str()) => sender.subscribe(),
            // a receiver whose sender is already gone: next() yields None
            _ => broadcast::channel(1).0.subscribe(),
        };
        ChangeStream {
            receiver,
            node: node.clone(),
        }
    }

    /// Delivers `delta` to every callback for its node, then to watchers.
    pub fn publish(&self, delta: &Delta) {
        let (callbacks, sender) = {
            let inner = self.lock();
            let callbacks: Vec<Callback> = inner
                .callbacks
                .get(delta.node.as_str())
                .map(|cbs| cbs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            (callbacks, inner.sender.clone())
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(delta))).is_err() {
                warn!(node = %delta.node, version = delta.version, "subscriber panicked");
            }
        }

        if let Some(sender) = sender {
            // no receivers is not an error
            let _ = sender.send(delta.clone());
        }
    }

    /// Number of live callbacks for `node`.
    pub fn callback_count(&self, node: &str) -> usize {
        self.lock().callbacks.get(node).map_or(0, Vec::len)
    }

    /// Drops every callback and ends every change stream.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.callbacks.clear();
        inner.registered.clear();
        inner.sender = None;
    }

    fn remove(&self, node: &NodeId, id: u64) {
        let mut inner = self.lock();
        if let Some(cbs) = inner.callbacks.get_mut(node.as_str()) {
            cbs.retain(|(cb_id, _)| *cb_id != id);
            if cbs.is_empty() {
                inner.callbacks.remove(node.as_str());
            }
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle to a registered callback.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    node: NodeId,
    id: Option<u64>,
    bus: Option<NotificationBus>,
}

impl Subscription {
    fn inert(node: NodeId) -> Self {
        Self {
            node,
            id: None,
            bus: None,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// False for subscriptions to unknown nodes.
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Removes the callback. Safe to call on inert subscriptions.
    pub fn unsubscribe(mut self) {
        if let (Some(bus), Some(id)) = (self.bus.take(), self.id.take()) {
            bus.remove(&self.node, id);
        }
    }
}

// =============================================================================
// Change Stream
// =============================================================================

/// Async receiver of one node's deltas.
///
/// # Example
///
/// ```rust,ignore
/// let mut changes = engine.watch("by_region");
/// while let Some(delta) = changes.next().await {
///     let delta = delta?;
///     println!("v{} changed {} groups", delta.version, delta.len());
/// }
/// ```
pub struct ChangeStream {
    receiver: broadcast::Receiver<Delta>,
    node: NodeId,
}

impl ChangeStream {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Waits for the next delta of this node.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(delta))` - Next delta
    /// - `Some(Err(Error::SubscriptionLagged(n)))` - `n` deltas were missed
    /// - `None` - The engine was destroyed
    pub async fn next(&mut self) -> Option<Result<Delta>> {
        loop {
            match self.receiver.recv().await {
                Ok(delta) if delta.node == self.node => return Some(Ok(delta)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered delta without waiting.
    pub fn try_next(&mut self) -> Option<Result<Delta>> {
        loop {
            match self.receiver.try_recv() {
                Ok(delta) if delta.node == self.node => return Some(Ok(delta)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(node: &str, version: u64) -> Delta {
        Delta {
            node: NodeId::new(node),
            version,
            timestamp_ms: 0,
            operations: Vec::new(),
        }
    }

    fn bus_with(nodes: &[&str]) -> NotificationBus {
        let bus = NotificationBus::new(DEFAULT_BROADCAST_CAPACITY);
        for n in nodes {
            bus.register(&NodeId::new(*n));
        }
        bus
    }

    #[test]
    fn test_callback_receives_own_node_only() {
        let bus = bus_with(&["a", "b"]);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(&NodeId::new("a"), move |d| {
            assert_eq!(d.node.as_str(), "a");
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.is_active());

        bus.publish(&delta("a", 1));
        bus.publish(&delta("b", 1));
        bus.publish(&delta("a", 2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_node_is_inert() {
        let bus = bus_with(&[]);
        let sub = bus.subscribe(&NodeId::new("ghost"), |_| panic!("must not fire"));
        assert!(!sub.is_active());
        bus.publish(&delta("ghost", 1));
        sub.unsubscribe();
    }

    #[test]
    fn test_unsubscribe() {
        let bus = bus_with(&["a"]);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(&NodeId::new("a"), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&delta("a", 1));
        sub.unsubscribe();
        bus.publish(&delta("a", 2));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.callback_count("a"), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let bus = bus_with(&["a"]);
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe(&NodeId::new("a"), |_| panic!("boom"));
        let h = hits.clone();
        let _good = bus.subscribe(&NodeId::new("a"), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&delta("a", 1));
        bus.publish(&delta("a", 2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_drops_callbacks() {
        let bus = bus_with(&["a"]);
        let _sub = bus.subscribe(&NodeId::new("a"), |_| {});
        bus.unregister(&NodeId::new("a"));
        assert_eq!(bus.callback_count("a"), 0);
        assert!(!bus.subscribe(&NodeId::new("a"), |_| {}).is_active());
    }

    #[tokio::test]
    async fn test_change_stream_filters_by_node() {
        let bus = bus_with(&["a", "b"]);
        let mut stream = bus.watch(&NodeId::new("b"));

        bus.publish(&delta("a", 1));
        bus.publish(&delta("b", 7));

        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.version, 7);
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn test_change_stream_lagged() {
        let bus = NotificationBus::new(2);
        bus.register(&NodeId::new("a"));
        let mut stream = bus.watch(&NodeId::new("a"));

        for v in 1..=5 {
            bus.publish(&delta("a", v));
        }

        let result = stream.next().await.unwrap();
        assert!(matches!(result, Err(Error::SubscriptionLagged(3))));
        // resumes at the oldest retained delta
        assert_eq!(stream.next().await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = bus_with(&["a"]);
        let mut stream = bus.watch(&NodeId::new("a"));
        bus.close();
        assert!(stream.next().await.is_none());
        assert!(bus.watch(&NodeId::new("a")).next().await.is_none());
        assert!(!bus.subscribe(&NodeId::new("a"), |_| {}).is_active());
    }
}
