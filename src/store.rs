//! Persisted state - a single JSON document per integration instance
//!
//! Holds contacts, pending expectations, per-phone context and the set of
//! processed vendor message ids. Every operation is a full load → mutate → save
//! round trip against a [`DocumentStore`].

use crate::error::{Error, Result};
use crate::parsing::ReplyType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage key prefix, suffixed with the instance id
pub const STORAGE_KEY: &str = "textnow.storage";

/// Default time-to-live for pending expectations
pub const DEFAULT_TTL_SECONDS: u64 = 300;

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECONDS
}

/// Stored contact fields (the id is the map key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub name: String,
    pub phone: String,
}

/// A contact with its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
}

/// A prompt awaiting a reply from one phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExpectation {
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_variable: Option<String>,
}

impl PendingExpectation {
    pub fn new(reply_type: ReplyType, ttl_seconds: u64) -> Self {
        Self {
            reply_type,
            options: Vec::new(),
            regex: None,
            created_at: Utc::now(),
            ttl_seconds,
            response_variable: None,
        }
    }

    pub fn choice(options: Vec<String>, ttl_seconds: u64) -> Self {
        Self {
            options,
            ..Self::new(ReplyType::Choice, ttl_seconds)
        }
    }

    pub fn with_regex(mut self, regex: Option<String>) -> Self {
        self.regex = regex;
        self
    }

    pub fn with_response_variable(mut self, name: Option<String>) -> Self {
        self.response_variable = name;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Expired once strictly more than `ttl_seconds` have elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = i64::try_from(self.ttl_seconds) else {
            return false;
        };
        match chrono::Duration::try_seconds(ttl) {
            Some(ttl) => now.signed_duration_since(self.created_at) > ttl,
            None => false,
        }
    }
}

/// Pending expectations for one phone, in insertion order
pub type PendingMap = IndexMap<String, PendingExpectation>;

/// The whole persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub contacts: IndexMap<String, ContactRecord>,
    #[serde(default)]
    pub pending: IndexMap<String, PendingMap>,
    #[serde(default)]
    pub context: IndexMap<String, Map<String, Value>>,
    #[serde(default)]
    pub processed_message_ids: IndexSet<String>,
}

impl StoreDocument {
    /// Reverse lookup of a contact id by canonical phone
    pub fn contact_id_for_phone(&self, phone: &str) -> Option<&str> {
        self.contacts
            .iter()
            .find(|(_, c)| c.phone == phone)
            .map(|(id, _)| id.as_str())
    }
}

/// Host-provided document persistence
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the stored document, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<StoreDocument>>;

    async fn save(&self, doc: &StoreDocument) -> Result<()>;
}

/// Document store backed by a JSON file, written atomically
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File for a given instance id inside `dir`
    pub fn for_instance(dir: &Path, instance_id: &str) -> Self {
        Self::new(dir.join(format!("{}_{}.json", STORAGE_KEY, instance_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> Result<Option<StoreDocument>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, doc: &StoreDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Write to a temp file in the same directory, then rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    Ok(())
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryDocumentStore {
    doc: std::sync::Mutex<Option<StoreDocument>>,
    saves: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(doc: StoreDocument) -> Self {
        Self {
            doc: std::sync::Mutex::new(Some(doc)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self) -> Result<Option<StoreDocument>> {
        Ok(self
            .doc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn save(&self, doc: &StoreDocument) -> Result<()> {
        *self
            .doc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(doc.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// CRUD over the persisted document
///
/// Mutations hold a per-instance lock across their load → save window, so a
/// poll cycle and a command handler can no longer overwrite each other.
pub struct StateStore {
    backend: Arc<dyn DocumentStore>,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the current document (empty if nothing stored yet)
    pub async fn load(&self) -> Result<StoreDocument> {
        Ok(self.backend.load().await?.unwrap_or_default())
    }

    /// Load, apply `f`, save; returns whatever `f` returns
    pub async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreDocument) -> T,
    {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let out = f(&mut doc);
        self.backend.save(&doc).await?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        let doc = self.load().await?;
        Ok(doc
            .contacts
            .into_iter()
            .map(|(id, c)| Contact {
                id,
                name: c.name,
                phone: c.phone,
            })
            .collect())
    }

    pub async fn contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        let doc = self.load().await?;
        Ok(doc.contacts.get(contact_id).map(|c| Contact {
            id: contact_id.to_string(),
            name: c.name.clone(),
            phone: c.phone.clone(),
        }))
    }

    pub async fn contact_by_phone(&self, phone: &str) -> Result<Option<Contact>> {
        let doc = self.load().await?;
        Ok(doc
            .contacts
            .iter()
            .find(|(_, c)| c.phone == phone)
            .map(|(id, c)| Contact {
                id: id.clone(),
                name: c.name.clone(),
                phone: c.phone.clone(),
            }))
    }

    /// Insert or replace a contact
    pub async fn save_contact(&self, contact_id: &str, name: &str, phone: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.contacts.insert(
                contact_id.to_string(),
                ContactRecord {
                    name: name.to_string(),
                    phone: phone.to_string(),
                },
            );
        })
        .await
    }

    /// Delete a contact and everything keyed by its phone
    pub async fn delete_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        let removed = self
            .mutate(|doc| {
                let record = doc.contacts.shift_remove(contact_id)?;
                doc.pending.shift_remove(&record.phone);
                doc.context.shift_remove(&record.phone);
                Some(Contact {
                    id: contact_id.to_string(),
                    name: record.name,
                    phone: record.phone,
                })
            })
            .await?;

        if let Some(ref c) = removed {
            debug!(contact_id = contact_id, phone = %c.phone, "Deleted contact with pending and context");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Pending expectations
    // ------------------------------------------------------------------

    pub async fn pending(&self, phone: &str) -> Result<PendingMap> {
        let doc = self.load().await?;
        Ok(doc.pending.get(phone).cloned().unwrap_or_default())
    }

    pub async fn all_pending(&self) -> Result<IndexMap<String, PendingMap>> {
        Ok(self.load().await?.pending)
    }

    /// Set (or overwrite) the expectation for `(phone, key)`
    pub async fn set_pending(
        &self,
        phone: &str,
        key: &str,
        expectation: PendingExpectation,
    ) -> Result<()> {
        self.mutate(|doc| {
            doc.pending
                .entry(phone.to_string())
                .or_default()
                .insert(key.to_string(), expectation);
        })
        .await
    }

    /// Clear one key, or every key when `key` is `None`; returns how many were removed
    pub async fn clear_pending(&self, phone: &str, key: Option<&str>) -> Result<usize> {
        self.mutate(|doc| {
            let Some(map) = doc.pending.get_mut(phone) else {
                return 0;
            };
            let removed = match key {
                Some(k) => usize::from(map.shift_remove(k).is_some()),
                None => {
                    let n = map.len();
                    map.clear();
                    n
                }
            };
            if map.is_empty() {
                doc.pending.shift_remove(phone);
            }
            removed
        })
        .await
    }

    /// Remove every expectation expired at `now`; returns the removed `(phone, key)` pairs
    pub async fn remove_expired(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        self.mutate(|doc| {
            let mut removed = Vec::new();
            for (phone, map) in doc.pending.iter_mut() {
                map.retain(|key, exp| {
                    if exp.is_expired(now) {
                        removed.push((phone.clone(), key.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            doc.pending.retain(|_, map| !map.is_empty());
            removed
        })
        .await
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    pub async fn context(&self, phone: &str) -> Result<Map<String, Value>> {
        let doc = self.load().await?;
        Ok(doc.context.get(phone).cloned().unwrap_or_default())
    }

    /// Merge keys into a phone's context; existing keys not in `values` are kept
    pub async fn merge_context(&self, phone: &str, values: Map<String, Value>) -> Result<()> {
        self.mutate(|doc| {
            doc.context
                .entry(phone.to_string())
                .or_default()
                .extend(values);
        })
        .await
    }

    // ------------------------------------------------------------------
    // Processed message ids
    // ------------------------------------------------------------------

    pub async fn mark_processed(&self, message_id: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.processed_message_ids.insert(message_id.to_string());
        })
        .await
    }

    pub async fn is_processed(&self, message_id: &str) -> Result<bool> {
        let doc = self.load().await?;
        Ok(doc.processed_message_ids.contains(message_id))
    }

    /// Wipe everything, including the processed-id set
    pub async fn reset(&self) -> Result<()> {
        self.mutate(|doc| *doc = StoreDocument::default()).await
    }
}
