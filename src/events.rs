//! Typed events and the per-instance publish/subscribe bus

use crate::parsing::{ReplyType, ReplyValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Integration domain, used as the event name prefix
pub const DOMAIN: &str = "textnow";

/// Event discriminant, used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    ReplyParsed,
    MessageSent,
    ContactAdded,
    ContactUpdated,
    ContactDeleted,
}

impl EventKind {
    /// Host event name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "textnow_message_received",
            EventKind::ReplyParsed => "textnow_reply_parsed",
            EventKind::MessageSent => "textnow_message_sent",
            EventKind::ContactAdded => "textnow_contact_added",
            EventKind::ContactUpdated => "textnow_contact_updated",
            EventKind::ContactDeleted => "textnow_contact_deleted",
        }
    }
}

/// An inbound message surfaced to automations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub phone: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: String,
    /// Contact id, or the raw phone if no contact matches
    pub contact_id: String,
}

/// An inbound message resolved a pending expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyParsed {
    pub phone: String,
    pub contact_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    pub value: ReplyValue,
    pub raw_text: String,
    pub option_index: Option<usize>,
    /// 1-based option number for choices, otherwise the value as text
    pub response_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_variable: Option<String>,
}

/// Outbound leg type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendKind {
    Sms,
    Mms,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSent {
    pub phone: String,
    pub contact_id: Option<String>,
    pub kind: SendKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactChanged {
    pub contact_id: String,
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDeleted {
    pub contact_id: String,
}

/// Everything the integration publishes
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MessageReceived(MessageReceived),
    ReplyParsed(ReplyParsed),
    MessageSent(MessageSent),
    ContactAdded(ContactChanged),
    ContactUpdated(ContactChanged),
    ContactDeleted(ContactDeleted),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MessageReceived(_) => EventKind::MessageReceived,
            Event::ReplyParsed(_) => EventKind::ReplyParsed,
            Event::MessageSent(_) => EventKind::MessageSent,
            Event::ContactAdded(_) => EventKind::ContactAdded,
            Event::ContactUpdated(_) => EventKind::ContactUpdated,
            Event::ContactDeleted(_) => EventKind::ContactDeleted,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Payload as a JSON object, for hosts with untyped event buses
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Event::MessageReceived(p) => serde_json::to_value(p),
            Event::ReplyParsed(p) => serde_json::to_value(p),
            Event::MessageSent(p) => serde_json::to_value(p),
            Event::ContactAdded(p) | Event::ContactUpdated(p) => serde_json::to_value(p),
            Event::ContactDeleted(p) => serde_json::to_value(p),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        // Dropped after the lock is released; a handler may own other subscriptions
        let removed = {
            let mut listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners
                .iter()
                .position(|l| l.id == id)
                .map(|pos| listeners.remove(pos))
        };
        drop(removed);
    }
}

/// Publish/subscribe bus owned by one integration instance
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every matching listener
    ///
    /// Handlers run synchronously on the caller's task, outside the listener lock.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners
                .iter()
                .filter(|l| l.kind.map_or(true, |k| k == kind))
                .map(|l| Arc::clone(&l.handler))
                .collect()
        };

        debug!(event = kind.name(), listeners = handlers.len(), "Emitting event");
        for handler in handlers {
            handler(&event);
        }
    }

    /// Listen for one kind of event until the returned [`Subscription`] is dropped
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_listener(Some(kind), Arc::new(handler))
    }

    /// Listen for every event
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_listener(None, Arc::new(handler))
    }

    /// Forward one kind of event into a channel
    pub fn listen(&self, kind: EventKind) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn add_listener(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Listener { id, kind, handler });

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }
}

/// Handle to a registered listener; unsubscribes on drop
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
