//! Subscription registry: channel name to callback and acknowledgment flag.
//!
//! The registry is the single source of truth replayed after every
//! reconnect. It is plain data; the streaming client wraps it in a mutex and
//! never holds that mutex across an await point or while running callbacks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use serde_json::Value;

/// Callback invoked for each data notification on a channel.
///
/// Parameters: `(channel, full_envelope)`
pub type ChannelCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Entry {
    callback: ChannelCallback,
    acknowledged: bool,
}

/// In-memory subscription table. At most one entry per channel.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: AHashMap<String, Entry>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, e.acknowledged)))
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `channel`.
    ///
    /// A new entry starts unacknowledged. Re-subscribing replaces the
    /// callback and keeps the current acknowledgment flag; the next ack
    /// (or a reconnect reset) updates it.
    pub fn subscribe(&mut self, channel: &str, callback: ChannelCallback) {
        match self.entries.get_mut(channel) {
            Some(entry) => entry.callback = callback,
            None => {
                self.entries.insert(channel.to_owned(), Entry { callback, acknowledged: false });
            }
        }
    }

    /// Remove `channel`. Returns `true` if it was registered.
    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.entries.remove(channel).is_some()
    }

    /// Copy of the `channel → acknowledged` map. Mutating it never affects the registry.
    pub fn get_subscriptions(&self) -> HashMap<String, bool> {
        self.entries.iter().map(|(k, e)| (k.clone(), e.acknowledged)).collect()
    }

    /// Mark `channel` as confirmed by the server. Returns `false` for unknown channels.
    pub fn mark_acknowledged(&mut self, channel: &str) -> bool {
        match self.entries.get_mut(channel) {
            Some(entry) => {
                entry.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Reset every entry to unacknowledged and return the channel names to replay.
    pub fn reset_for_resubscribe(&mut self) -> Vec<String> {
        let mut channels = Vec::with_capacity(self.entries.len());
        for (name, entry) in self.entries.iter_mut() {
            entry.acknowledged = false;
            channels.push(name.clone());
        }
        channels.sort_unstable();
        channels
    }

    /// Callback registered for `channel`, cloned so it can run outside the lock.
    pub fn callback(&self, channel: &str) -> Option<ChannelCallback> {
        self.entries.get(channel).map(|e| Arc::clone(&e.callback))
    }

    pub fn is_acknowledged(&self, channel: &str) -> Option<bool> {
        self.entries.get(channel).map(|e| e.acknowledged)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.entries.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn noop() -> ChannelCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn subscribe_and_ack() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("bbo.BTC-USD-PERP", noop());
        assert_eq!(reg.is_acknowledged("bbo.BTC-USD-PERP"), Some(false));

        assert!(reg.mark_acknowledged("bbo.BTC-USD-PERP"));
        assert!(!reg.mark_acknowledged("trades.BTC-USD-PERP"));
        assert_eq!(reg.is_acknowledged("bbo.BTC-USD-PERP"), Some(true));
    }

    #[test]
    fn resubscribe_overwrites_callback_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("account", noop());
        reg.mark_acknowledged("account");

        let h = Arc::clone(&hits);
        reg.subscribe("account", Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.is_acknowledged("account"), Some(true));

        (reg.callback("account").unwrap())("account", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_subscriptions_is_a_copy() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("positions", noop());

        let mut copy = reg.get_subscriptions();
        copy.insert("positions".into(), true);
        copy.insert("fake".into(), true);

        assert_eq!(reg.is_acknowledged("positions"), Some(false));
        assert!(!reg.contains("fake"));
    }

    #[test]
    fn reset_for_resubscribe_clears_acks() {
        let mut reg = SubscriptionRegistry::new();
        for ch in ["a", "b", "c"] {
            reg.subscribe(ch, noop());
            reg.mark_acknowledged(ch);
        }
        assert_eq!(reg.reset_for_resubscribe(), vec!["a", "b", "c"]);
        assert!(reg.get_subscriptions().values().all(|acked| !acked));
    }

    #[test]
    fn unsubscribe_removes() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("transfers", noop());
        assert!(reg.unsubscribe("transfers"));
        assert!(!reg.unsubscribe("transfers"));
        assert!(reg.is_empty());
    }
}
