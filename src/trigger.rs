//! Automation triggers on inbound messages

use crate::events::{Event, EventBus, EventKind, MessageReceived, Subscription, DOMAIN};
use crate::phone::canonical_or_raw;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ENTITY_PREFIX: &str = "sensor.textnow_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    MessageReceived,
    /// Fires when the text contains `phrase`, case-insensitively
    PhraseReceived { phrase: String },
}

impl TriggerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::MessageReceived => "message_received",
            TriggerKind::PhraseReceived { .. } => "phrase_received",
        }
    }
}

/// Trigger configuration, e.g. `{"type": "phrase_received", "phrase": "garage", "contact_id": "contact_mom"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTrigger {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Data handed to the automation when a trigger fires
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerPayload {
    pub platform: &'static str,
    #[serde(rename = "type")]
    pub trigger_type: &'static str,
    pub phone: String,
    pub contact_id: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: String,
    /// Entity id of the sender's sensor, for replying to the sender
    pub entity_id: String,
    /// The configured phrase, trimmed and lowercased, for `phrase_received` triggers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_phrase: Option<String>,
}

impl MessageTrigger {
    pub fn message_received() -> Self {
        Self {
            kind: TriggerKind::MessageReceived,
            contact_id: None,
            phone: None,
        }
    }

    pub fn phrase(phrase: &str) -> Self {
        Self {
            kind: TriggerKind::PhraseReceived {
                phrase: phrase.to_string(),
            },
            ..Self::message_received()
        }
    }

    pub fn for_contact(mut self, contact_id: &str) -> Self {
        self.contact_id = Some(contact_id.to_string());
        self
    }

    pub fn for_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    /// Payload if `msg` passes the filters
    pub fn matches(&self, msg: &MessageReceived) -> Option<TriggerPayload> {
        if let Some(filter) = self.contact_id.as_deref().filter(|f| !f.is_empty()) {
            let bare = filter.strip_prefix(ENTITY_PREFIX).unwrap_or(filter);
            if msg.contact_id != bare && msg.contact_id != filter {
                return None;
            }
        }

        if let Some(filter) = self.phone.as_deref().filter(|f| !f.is_empty()) {
            if msg.phone != canonical_or_raw(filter) {
                return None;
            }
        }

        let matched_phrase = match &self.kind {
            TriggerKind::PhraseReceived { phrase } => {
                let needle = phrase.trim().to_lowercase();
                if needle.is_empty() {
                    warn!("Phrase trigger has no phrase configured");
                    return None;
                }
                if !msg.text.to_lowercase().contains(&needle) {
                    return None;
                }
                debug!(phrase = %needle, "Phrase matched");
                Some(needle)
            }
            TriggerKind::MessageReceived => None,
        };

        Some(TriggerPayload {
            platform: DOMAIN,
            trigger_type: self.kind.name(),
            phone: msg.phone.clone(),
            contact_id: msg.contact_id.clone(),
            text: msg.text.clone(),
            message_id: msg.message_id.clone(),
            timestamp: msg.timestamp.clone(),
            entity_id: format!("{}{}", ENTITY_PREFIX, msg.contact_id),
            matched_phrase,
        })
    }

    /// Run `action` for every matching message until the subscription is dropped
    pub fn attach<F>(self, bus: &EventBus, action: F) -> Subscription
    where
        F: Fn(TriggerPayload) + Send + Sync + 'static,
    {
        bus.subscribe(EventKind::MessageReceived, move |event| {
            if let Event::MessageReceived(msg) = event {
                if let Some(payload) = self.matches(msg) {
                    action(payload);
                }
            }
        })
    }
}
