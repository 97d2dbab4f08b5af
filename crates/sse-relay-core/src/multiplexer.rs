use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::debug;

/// Receives every message the multiplexer delivers, whatever its channel.
pub trait MessageListener: Send + Sync {
    fn notify(&self, channel: &str, payload: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// The pub/sub client shared by every session. Implementations serialize
/// their own subscription and listener bookkeeping.
pub trait ChannelMultiplexer: Send + Sync {
    fn subscribe(&self, channel: &str);
    fn unsubscribe(&self, channel: &str);
    fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId;
    /// Removing an unknown id is a no-op.
    fn remove_listener(&self, id: ListenerId);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub listeners: usize,
    pub subscriptions: BTreeMap<String, usize>,
    pub subscribe_calls: u64,
    pub unsubscribe_calls: u64,
    pub notify_calls: u64,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, usize>,
    listeners: BTreeMap<ListenerId, Arc<dyn MessageListener>>,
    unsubscribe_calls_by_channel: HashMap<String, u64>,
}

/// In-process multiplexer. Channel subscriptions are reference counted so one
/// session unsubscribing never drops the channel for its neighbours.
#[derive(Default)]
pub struct LocalMultiplexer {
    registry: RwLock<Registry>,
    listener_counter: AtomicU64,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    notify_calls: AtomicU64,
}

impl LocalMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `payload` to every registered listener when `channel` has at
    /// least one subscriber. Returns the number of listeners notified.
    pub fn publish(&self, channel: &str, payload: Option<&str>) -> usize {
        let listeners = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            if !registry.subscriptions.contains_key(channel) {
                debug!(event = "publish_unsubscribed", channel = channel);
                return 0;
            }
            registry.listeners.values().cloned().collect::<Vec<_>>()
        };
        for listener in &listeners {
            self.notify_calls.fetch_add(1, Ordering::SeqCst);
            listener.notify(channel, payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn subscription_count(&self, channel: &str) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    pub fn unsubscribe_calls_for(&self, channel: &str) -> u64 {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe_calls_by_channel
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MultiplexerStats {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        MultiplexerStats {
            listeners: registry.listeners.len(),
            subscriptions: registry
                .subscriptions
                .iter()
                .map(|(channel, count)| (channel.clone(), *count))
                .collect(),
            subscribe_calls: self.subscribe_calls.load(Ordering::SeqCst),
            unsubscribe_calls: self.unsubscribe_calls.load(Ordering::SeqCst),
            notify_calls: self.notify_calls.load(Ordering::SeqCst),
        }
    }
}

impl ChannelMultiplexer for LocalMultiplexer {
    fn subscribe(&self, channel: &str) {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        *registry
            .subscriptions
            .entry(channel.to_string())
            .or_default() += 1;
    }

    fn unsubscribe(&self, channel: &str) {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        *registry
            .unsubscribe_calls_by_channel
            .entry(channel.to_string())
            .or_default() += 1;
        if let Some(count) = registry.subscriptions.get_mut(channel) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registry.subscriptions.remove(channel);
            }
        }
    }

    fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .remove(&id);
    }
}
