//! Outport message stream.
//!
//! [`MessageEvent`] is a small observable. Each `subscribe` returns a
//! [`Subscription`] guard; dropping the guard removes the listener, so a
//! binding cannot outlive its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    Number(f64),
    List(Vec<f64>),
}

impl MessagePayload {
    pub fn first(&self) -> Option<f64> {
        match self {
            MessagePayload::Number(value) => Some(*value),
            MessagePayload::List(values) => values.first().copied(),
        }
    }
}

impl From<f64> for MessagePayload {
    fn from(value: f64) -> Self {
        MessagePayload::Number(value)
    }
}

impl From<Vec<f64>> for MessagePayload {
    fn from(values: Vec<f64>) -> Self {
        MessagePayload::List(values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutportMessage {
    pub tag: String,
    pub payload: MessagePayload,
}

impl OutportMessage {
    pub fn new(tag: impl Into<String>, payload: impl Into<MessagePayload>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    All,
    /// Exact tag match.
    Tag(String),
}

impl MessageFilter {
    fn accepts(&self, message: &OutportMessage) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::Tag(tag) => *tag == message.tag,
        }
    }
}

type Callback = Arc<dyn Fn(&OutportMessage) + Send + Sync>;

struct Listener {
    id: u64,
    filter: MessageFilter,
    callback: Callback,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

#[derive(Clone, Default)]
pub struct MessageEvent {
    listeners: Arc<Mutex<Listeners>>,
}

impl MessageEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, filter: MessageFilter, callback: F) -> Subscription
    where
        F: Fn(&OutportMessage) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        let alive = Arc::new(AtomicBool::new(true));
        listeners.entries.push(Listener {
            id,
            filter,
            callback: Arc::new(callback),
            alive: Arc::clone(&alive),
        });
        Subscription {
            id,
            alive,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver `message` to every matching listener. Returns how many ran.
    ///
    /// Callbacks run after the listener lock is released, so a callback may
    /// drop its own subscription or another one. A listener unsubscribed
    /// before its turn is skipped.
    pub fn emit(&self, message: &OutportMessage) -> usize {
        let matching: Vec<(Callback, Arc<AtomicBool>)> = self
            .lock()
            .entries
            .iter()
            .filter(|listener| listener.filter.accepts(message))
            .map(|listener| (Arc::clone(&listener.callback), Arc::clone(&listener.alive)))
            .collect();
        let mut delivered = 0;
        for (callback, alive) in &matching {
            if alive.load(Ordering::Acquire) {
                callback(message);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }
}

impl std::fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEvent")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Live listener registration. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    alive: Arc<AtomicBool>,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.listeners
            .upgrade()
            .map(|listeners| {
                listeners
                    .lock()
                    .map(|guard| guard.entries.iter().any(|l| l.id == self.id))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.entries.retain(|listener| listener.id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tag_filter_is_exact() {
        let event = MessageEvent::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = event.subscribe(MessageFilter::Tag("foo".into()), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(event.emit(&OutportMessage::new("foo", 1.0)), 1);
        assert_eq!(event.emit(&OutportMessage::new("foobar", 1.0)), 0);
        assert_eq!(event.emit(&OutportMessage::new("bar", 1.0)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let event = MessageEvent::new();
        let sub = event.subscribe(MessageFilter::All, |_| {});
        assert!(sub.is_active());
        assert_eq!(event.subscriber_count(), 1);
        drop(sub);
        assert_eq!(event.subscriber_count(), 0);
        assert_eq!(event.emit(&OutportMessage::new("x", 0.0)), 0);
    }

    #[test]
    fn listener_dropped_mid_emit_is_skipped() {
        let event = MessageEvent::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let late_hits = Arc::new(AtomicUsize::new(0));

        let victim = Arc::clone(&slot);
        let _first = event.subscribe(MessageFilter::All, move |_| {
            victim.lock().unwrap().take();
        });
        let counter = Arc::clone(&late_hits);
        *slot.lock().unwrap() = Some(event.subscribe(MessageFilter::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(event.emit(&OutportMessage::new("foo", 1.0)), 1);
        assert_eq!(event.subscriber_count(), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscription_outliving_event_is_harmless() {
        let event = MessageEvent::new();
        let sub = event.subscribe(MessageFilter::All, |_| {});
        drop(event);
        assert!(!sub.is_active());
        drop(sub);
    }

    #[test]
    fn payload_accepts_numbers_and_lists() {
        let number: MessagePayload = serde_json::from_str("1500").unwrap();
        assert_eq!(number, MessagePayload::Number(1500.0));
        let list: MessagePayload = serde_json::from_str("[1, 2.5]").unwrap();
        assert_eq!(list.first(), Some(1.0));
    }
}
