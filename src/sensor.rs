//! Per-contact sensor snapshots
//!
//! One [`ContactSensor`] per stored contact, kept current from bus events and
//! the store.

use crate::error::Result;
use crate::events::{Event, EventBus, DOMAIN};
use crate::store::{Contact, PendingMap, StateStore};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// State shown before anything has been received
pub const NO_MESSAGES: &str = "No messages";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactSensor {
    pub contact_id: String,
    pub name: String,
    pub phone: String,
    pub last_inbound: Option<String>,
    pub last_inbound_ts: Option<String>,
    pub last_outbound: Option<String>,
    pub last_outbound_ts: Option<DateTime<Utc>>,
    pub pending: PendingMap,
    pub context: Map<String, Value>,
}

impl ContactSensor {
    fn new(contact: Contact) -> Self {
        Self {
            contact_id: contact.id,
            name: contact.name,
            phone: contact.phone,
            last_inbound: None,
            last_inbound_ts: None,
            last_outbound: None,
            last_outbound_ts: None,
            pending: PendingMap::new(),
            context: Map::new(),
        }
    }

    pub fn unique_id(&self) -> String {
        format!("{}_{}", DOMAIN, self.contact_id)
    }

    pub fn display_name(&self) -> String {
        format!("TextNow {}", self.name)
    }

    /// Last inbound text, or [`NO_MESSAGES`]
    pub fn state(&self) -> &str {
        self.last_inbound.as_deref().unwrap_or(NO_MESSAGES)
    }

    pub fn attributes(&self) -> Value {
        json!({
            "phone": self.phone,
            "last_inbound": self.last_inbound,
            "last_inbound_ts": self.last_inbound_ts,
            "last_outbound": self.last_outbound,
            "last_outbound_ts": self.last_outbound_ts,
            "pending": self.pending,
            "context": self.context,
        })
    }
}

/// All contact sensors for one instance
pub struct SensorBoard {
    store: Arc<StateStore>,
    sensors: RwLock<IndexMap<String, ContactSensor>>,
}

impl SensorBoard {
    /// Build a sensor for every stored contact
    pub async fn load(store: Arc<StateStore>) -> Result<Self> {
        let doc = store.load().await?;
        let sensors = doc
            .contacts
            .iter()
            .map(|(id, record)| {
                let mut sensor = ContactSensor::new(Contact {
                    id: id.clone(),
                    name: record.name.clone(),
                    phone: record.phone.clone(),
                });
                sensor.pending = doc.pending.get(&record.phone).cloned().unwrap_or_default();
                sensor.context = doc.context.get(&record.phone).cloned().unwrap_or_default();
                (id.clone(), sensor)
            })
            .collect();

        Ok(Self {
            store,
            sensors: RwLock::new(sensors),
        })
    }

    pub fn get(&self, contact_id: &str) -> Option<ContactSensor> {
        self.read().get(contact_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ContactSensor> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Update sensors for one event
    pub async fn apply(&self, event: &Event) -> Result<()> {
        match event {
            Event::MessageReceived(msg) => {
                self.for_phone(&msg.phone, |s| {
                    s.last_inbound = Some(msg.text.clone());
                    s.last_inbound_ts = Some(msg.timestamp.clone());
                });
                self.refresh_phone(&msg.phone).await?;
            }
            Event::ReplyParsed(reply) => self.refresh_phone(&reply.phone).await?,
            Event::MessageSent(sent) => {
                self.for_phone(&sent.phone, |s| {
                    s.last_outbound = Some("Sent".to_string());
                    s.last_outbound_ts = Some(sent.timestamp);
                });
            }
            Event::ContactAdded(c) => {
                let sensor = ContactSensor::new(Contact {
                    id: c.contact_id.clone(),
                    name: c.name.clone(),
                    phone: c.phone.clone(),
                });
                debug!(contact_id = %c.contact_id, "Adding sensor");
                self.write().insert(c.contact_id.clone(), sensor);
                self.refresh_phone(&c.phone).await?;
            }
            Event::ContactUpdated(c) => {
                {
                    let mut sensors = self.write();
                    if let Some(sensor) = sensors.get_mut(&c.contact_id) {
                        sensor.name = c.name.clone();
                        sensor.phone = c.phone.clone();
                    }
                }
                self.refresh_phone(&c.phone).await?;
            }
            Event::ContactDeleted(c) => {
                debug!(contact_id = %c.contact_id, "Removing sensor");
                self.write().shift_remove(&c.contact_id);
            }
        }
        Ok(())
    }

    /// Apply bus events in the background until the handle is aborted
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });

        tokio::spawn(async move {
            let _subscription = subscription;
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.apply(&event).await {
                    warn!(event = event.name(), error = %e, "Failed to update sensors");
                }
            }
        })
    }

    /// Reload pending and context for every sensor on `phone`
    async fn refresh_phone(&self, phone: &str) -> Result<()> {
        let pending = self.store.pending(phone).await?;
        let context = self.store.context(phone).await?;
        self.for_phone(phone, |s| {
            s.pending = pending.clone();
            s.context = context.clone();
        });
        Ok(())
    }

    fn for_phone(&self, phone: &str, mut f: impl FnMut(&mut ContactSensor)) {
        for sensor in self.write().values_mut().filter(|s| s.phone == phone) {
            f(sensor);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, ContactSensor>> {
        self.sensors.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, ContactSensor>> {
        self.sensors.write().unwrap_or_else(|p| p.into_inner())
    }
}
