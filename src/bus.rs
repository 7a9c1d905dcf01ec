//! Keyed change-notification bus.
//!
//! The source pattern this replaces is "manager extends an event emitter,
//! listeners attach by event name." Rust has no inheritance to lean on,
//! so this is instead an explicit map from subscription key to a set of
//! callbacks, owned by the manager. A key is either the sentinel "all"
//! or a specific tool index; publishing to a tool index walks both its
//! own callbacks and the "all" callbacks.
//!
//! Subscription and publication never await anything — the bus is a
//! plain synchronous data structure guarded by the same lock as the rest
//! of the manager's state, so it is always called from inside an already
//! acquired write lock.

use std::collections::HashMap;

/// A notification that some tool's observable state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolChanged {
    pub tool_index: usize,
}

type Callback = Box<dyn Fn(ToolChanged) + Send + Sync>;

/// Either the global sentinel or a specific tool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    All,
    Tool(usize),
}

/// Opaque handle returned from [`SubscriptionBus::subscribe`], usable to
/// unsubscribe later via [`SubscriptionBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    key: SubscriptionKeyPublic,
    id: u64,
}

/// The public spelling of a subscription key, used by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKeyPublic {
    All,
    Tool(usize),
}

impl From<SubscriptionKeyPublic> for Key {
    fn from(value: SubscriptionKeyPublic) -> Self {
        match value {
            SubscriptionKeyPublic::All => Key::All,
            SubscriptionKeyPublic::Tool(i) => Key::Tool(i),
        }
    }
}

#[derive(Default)]
pub struct SubscriptionBus {
    subscribers: HashMap<Key, Vec<(u64, Callback)>>,
    next_id: u64,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `key`. The callback must be
    /// non-blocking: it runs synchronously, inline, during `publish`.
    pub fn subscribe(
        &mut self,
        key: SubscriptionKeyPublic,
        callback: impl Fn(ToolChanged) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers
            .entry(key.into())
            .or_default()
            .push((id, Box::new(callback)));
        SubscriptionHandle { key, id }
    }

    /// Removes a previously registered subscription. Unsubscribing twice,
    /// or with a stale handle from a bus that has since been cleared, is
    /// a harmless no-op.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        if let Some(bucket) = self.subscribers.get_mut(&handle.key.into()) {
            bucket.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Invokes every callback registered for `tool_index`, then every
    /// callback registered for "all".
    pub fn publish(&self, tool_index: usize) {
        let event = ToolChanged { tool_index };
        if let Some(bucket) = self.subscribers.get(&Key::Tool(tool_index)) {
            for (_, callback) in bucket {
                callback(event);
            }
        }
        if let Some(bucket) = self.subscribers.get(&Key::All) {
            for (_, callback) in bucket {
                callback(event);
            }
        }
    }

    /// Clears every tool-specific subscription (indices may have been
    /// reassigned by a reload) while preserving "all" subscribers.
    pub fn clear_tool_subscriptions(&mut self) {
        self.subscribers.retain(|key, _| *key == Key::All);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tool_subscriber_only_sees_its_own_index() {
        let mut bus = SubscriptionBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.subscribe(SubscriptionKeyPublic::Tool(1), move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(0);
        bus.publish(1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_subscriber_sees_every_publish() {
        let mut bus = SubscriptionBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.subscribe(SubscriptionKeyPublic::All, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(0);
        bus.publish(7);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        let mut bus = SubscriptionBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handle = bus.subscribe(SubscriptionKeyPublic::Tool(0), move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(0);
        bus.unsubscribe(handle);
        bus.publish(0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_tool_subscriptions_preserves_all_subscribers() {
        let mut bus = SubscriptionBus::new();
        let tool_seen = Arc::new(AtomicUsize::new(0));
        let all_seen = Arc::new(AtomicUsize::new(0));
        let tool_clone = tool_seen.clone();
        let all_clone = all_seen.clone();
        bus.subscribe(SubscriptionKeyPublic::Tool(0), move |_| {
            tool_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(SubscriptionKeyPublic::All, move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.clear_tool_subscriptions();
        bus.publish(0);
        assert_eq!(tool_seen.load(Ordering::SeqCst), 0);
        assert_eq!(all_seen.load(Ordering::SeqCst), 1);
    }
}
