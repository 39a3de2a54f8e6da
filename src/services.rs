//! Command handlers invoked by the automation layer
//!
//! Every command takes a flat JSON argument map (see [`Services::call`]) or
//! the typed argument struct directly.

use crate::client::VendorApi;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{
    ContactChanged, ContactDeleted, Event, EventBus, EventKind, MessageSent, ReplyParsed, SendKind,
};
use crate::parsing::{ReplyType, ReplyValue};
use crate::phone::format_phone;
use crate::store::{Contact, ContactRecord, PendingExpectation, StateStore};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Pending key used by `send_menu`
pub const MENU_KEY: &str = "menu";

/// Pending key used by `prompt` when the caller gives none
pub const DEFAULT_PROMPT_KEY: &str = "default";

pub const MIN_WAIT_SECS: u64 = 5;
pub const MAX_WAIT_SECS: u64 = 3600;

/// Entity-id prefix accepted in place of a bare contact id
const ENTITY_PREFIX: &str = "sensor.textnow_";

/// Who a command is addressed to; first non-blank field wins
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Recipient {
    pub contact_from_trigger: Option<String>,
    pub contact_id: Option<String>,
    pub phone: Option<String>,
}

impl Recipient {
    pub fn contact(id: &str) -> Self {
        Self {
            contact_id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn phone(phone: &str) -> Self {
        Self {
            phone: Some(phone.to_string()),
            ..Self::default()
        }
    }
}

/// Menu options as a multiline string (one per line) or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OptionList {
    Lines(String),
    List(Vec<String>),
}

impl Default for OptionList {
    fn default() -> Self {
        OptionList::List(Vec::new())
    }
}

impl OptionList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OptionList::Lines(text) => parse_options_text(&text),
            OptionList::List(items) => items
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendArgs {
    #[serde(flatten)]
    pub to: Recipient,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub mms_image: Option<String>,
    #[serde(default)]
    pub voice_audio: Option<String>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMenuArgs {
    #[serde(flatten)]
    pub to: Recipient,
    pub options: OptionList,
    #[serde(default = "yes")]
    pub include_header: bool,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default = "yes")]
    pub include_footer: bool,
    #[serde(default)]
    pub footer: Option<String>,
    /// Seconds to wait for a reply
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub number_format: Option<String>,
}

impl SendMenuArgs {
    pub fn new(to: Recipient, options: Vec<String>) -> Self {
        Self {
            to,
            options: OptionList::List(options),
            include_header: true,
            header: None,
            include_footer: true,
            footer: None,
            timeout: None,
            number_format: None,
        }
    }
}

fn text_reply() -> ReplyType {
    ReplyType::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptArgs {
    #[serde(flatten)]
    pub to: Recipient,
    pub message: String,
    #[serde(rename = "type", default = "text_reply")]
    pub reply_type: ReplyType,
    #[serde(default)]
    pub options: OptionList,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub response_variable: Option<String>,
    /// Block until a reply or the timeout
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearPendingArgs {
    #[serde(flatten)]
    pub to: Recipient,
    /// Clear only this key; every key when absent
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetContextArgs {
    #[serde(flatten)]
    pub to: Recipient,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactArgs {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

/// Outcome of `send_menu`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuResult {
    /// 1-based option number, 0 on timeout
    pub option: usize,
    /// Zero-based index, -1 on timeout
    pub option_index: i64,
    pub value: String,
    pub raw_text: String,
    pub phone: String,
    pub contact_id: String,
    pub timed_out: bool,
}

impl MenuResult {
    fn timed_out(phone: &str, contact_id: &str) -> Self {
        Self {
            option: 0,
            option_index: -1,
            value: String::new(),
            raw_text: String::new(),
            phone: phone.to_string(),
            contact_id: contact_id.to_string(),
            timed_out: true,
        }
    }

    fn from_reply(reply: ReplyParsed) -> Self {
        let option_index = reply.option_index.map_or(-1, |i| i as i64);
        Self {
            option: reply.option_index.map_or(0, |i| i + 1),
            option_index,
            value: reply.value.to_string(),
            raw_text: reply.raw_text,
            phone: reply.phone,
            contact_id: reply.contact_id,
            timed_out: false,
        }
    }
}

/// Outcome of a waiting `prompt`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptResult {
    pub key: String,
    pub value: Option<ReplyValue>,
    pub raw_text: String,
    pub option_index: Option<usize>,
    pub response_number: Option<String>,
    pub response_variable: Option<String>,
    pub phone: String,
    pub contact_id: String,
    pub timed_out: bool,
}

/// A resolved recipient
#[derive(Debug, Clone, PartialEq)]
struct Target {
    phone: String,
    contact_id: Option<String>,
}

impl Target {
    fn contact_or_phone(&self) -> &str {
        self.contact_id.as_deref().unwrap_or(&self.phone)
    }
}

/// Render the menu message
///
/// Header and footer are separated from the options by a blank line and
/// omitted when empty. `number_format` may use `{n}` and `{option}`.
pub fn build_menu_text(header: &str, options: &[String], footer: &str, number_format: &str) -> String {
    let mut lines = Vec::with_capacity(options.len() + 4);
    if !header.is_empty() {
        lines.push(header.to_string());
        lines.push(String::new());
    }
    for (idx, option) in options.iter().enumerate() {
        lines.push(
            number_format
                .replace("{n}", &(idx + 1).to_string())
                .replace("{option}", option),
        );
    }
    if !footer.is_empty() {
        lines.push(String::new());
        lines.push(footer.to_string());
    }
    lines.join("\n")
}

/// One option per non-empty line
pub fn parse_options_text(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn contact_slug(name: &str) -> String {
    format!("contact_{}", name.to_lowercase().replace(' ', "_"))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_wait(timeout: u64) -> Result<Duration> {
    if !(MIN_WAIT_SECS..=MAX_WAIT_SECS).contains(&timeout) {
        return Err(Error::Validation(format!(
            "timeout must be between {} and {} seconds, got {}",
            MIN_WAIT_SECS, MAX_WAIT_SECS, timeout
        )));
    }
    Ok(Duration::from_secs(timeout))
}

/// Wait for the `reply_parsed` event for `(phone, key)`, or `None` on timeout
async fn wait_for_reply(
    rx: &mut UnboundedReceiver<Event>,
    phone: &str,
    key: &str,
    timeout: Duration,
) -> Option<ReplyParsed> {
    let matching = async {
        while let Some(event) = rx.recv().await {
            if let Event::ReplyParsed(reply) = event {
                if reply.phone == phone && reply.key == key {
                    return Some(reply);
                }
            }
        }
        None
    };
    tokio::time::timeout(timeout, matching).await.ok().flatten()
}

/// Command surface for one integration instance
pub struct Services {
    config: Arc<Config>,
    store: Arc<StateStore>,
    api: Arc<dyn VendorApi>,
    bus: EventBus,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateStore>,
        api: Arc<dyn VendorApi>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            api,
            bus,
        }
    }

    /// Dispatch a command by name with a flat argument map
    ///
    /// Commands with a result (`send_menu`, a waiting `prompt`, contact CRUD)
    /// return it as JSON.
    pub async fn call(&self, name: &str, args: Value) -> Result<Option<Value>> {
        let args = if args.is_null() { json!({}) } else { args };
        debug!(command = name, "Handling command");

        match name {
            "send" => {
                self.send(parse_args(args)?).await?;
                Ok(None)
            }
            "send_menu" => {
                let result = self.send_menu(parse_args(args)?).await?;
                Ok(Some(serde_json::to_value(result)?))
            }
            "prompt" => {
                let result = self.prompt(parse_args(args)?).await?;
                Ok(result.map(serde_json::to_value).transpose()?)
            }
            "clear_pending" => {
                let removed = self.clear_pending(parse_args(args)?).await?;
                Ok(Some(json!({ "removed": removed })))
            }
            "set_context" => {
                self.set_context(parse_args(args)?).await?;
                Ok(None)
            }
            "list_contacts" => Ok(Some(serde_json::to_value(self.store.contacts().await?)?)),
            "add_contact" => {
                let args: ContactArgs = parse_args(args)?;
                let contact = self.add_contact(&args.name, &args.phone).await?;
                Ok(Some(serde_json::to_value(contact)?))
            }
            "update_contact" => {
                let args: ContactArgs = parse_args(args)?;
                let id = required_id(&args)?;
                let contact = self.update_contact(id, &args.name, &args.phone).await?;
                Ok(Some(serde_json::to_value(contact)?))
            }
            "delete_contact" => {
                let args: ContactArgs = parse_args(args)?;
                let contact = self.delete_contact(required_id(&args)?).await?;
                Ok(Some(serde_json::to_value(contact)?))
            }
            other => Err(Error::Validation(format!("unknown command: {}", other))),
        }
    }

    /// Send SMS, then MMS, then voice; each leg is optional but one is required
    pub async fn send(&self, args: SendArgs) -> Result<()> {
        let image = non_blank(&args.mms_image).map(str::to_string);
        let voice = non_blank(&args.voice_audio).map(str::to_string);
        let has_text = !args.message.is_empty();

        if !has_text && image.is_none() && voice.is_none() {
            return Err(Error::Validation(
                "one of message, mms_image or voice_audio is required".to_string(),
            ));
        }

        let target = self.resolve(&args.to).await?;

        // Attachments are read before anything is sent
        let image = match image {
            Some(path) => Some(self.read_attachment(&path).await?),
            None => None,
        };
        let voice = match voice {
            Some(path) => Some(self.read_attachment(&path).await?),
            None => None,
        };

        if has_text {
            self.api.send_sms(&target.phone, &args.message).await?;
            info!(phone = %target.phone, "Sent SMS");
            self.emit_sent(&target, SendKind::Sms);
        }

        if let Some((bytes, filename)) = image {
            self.api
                .send_mms(&target.phone, &args.message, bytes, &filename)
                .await?;
            info!(phone = %target.phone, filename = %filename, "Sent MMS");
            self.emit_sent(&target, SendKind::Mms);
        }

        if let Some((bytes, filename)) = voice {
            self.api.send_voice(&target.phone, bytes, &filename).await?;
            info!(phone = %target.phone, filename = %filename, "Sent voice message");
            self.emit_sent(&target, SendKind::Voice);
        }

        Ok(())
    }

    /// Send a numbered menu and wait for the choice
    ///
    /// Only a `reply_parsed` for this phone under the `menu` key resolves the
    /// wait; replies to other prompts pending for the same phone are ignored.
    /// A second menu to the same phone replaces the first one's pending
    /// expectation. Dropping the returned future unsubscribes the wait.
    pub async fn send_menu(&self, args: SendMenuArgs) -> Result<MenuResult> {
        let options = args.options.into_vec();
        if options.is_empty() {
            return Err(Error::Validation(
                "send_menu needs at least one option".to_string(),
            ));
        }
        let timeout_secs = args.timeout.unwrap_or(self.config.menu_timeout_secs);
        let timeout = check_wait(timeout_secs)?;

        let header = if args.include_header {
            args.header.unwrap_or_else(|| self.config.menu_header.clone())
        } else {
            String::new()
        };
        let footer = if args.include_footer {
            args.footer.unwrap_or_else(|| self.config.menu_footer.clone())
        } else {
            String::new()
        };
        let number_format = args
            .number_format
            .unwrap_or_else(|| self.config.number_format.clone());

        let target = self.resolve(&args.to).await?;
        let text = build_menu_text(&header, &options, &footer, &number_format);

        // Subscribed before sending so a fast reply is not missed
        let (subscription, mut rx) = self.bus.listen(EventKind::ReplyParsed);

        self.api.send_sms(&target.phone, &text).await?;
        self.emit_sent(&target, SendKind::Sms);
        let option_count = options.len();
        self.store
            .set_pending(
                &target.phone,
                MENU_KEY,
                PendingExpectation::choice(options, timeout_secs),
            )
            .await?;
        info!(phone = %target.phone, options = option_count, timeout_secs = timeout_secs, "Sent menu, waiting for reply");

        let reply = wait_for_reply(&mut rx, &target.phone, MENU_KEY, timeout).await;
        subscription.unsubscribe();

        Ok(match reply {
            Some(reply) => {
                let result = MenuResult::from_reply(reply);
                info!(phone = %target.phone, option = result.option, "Menu answered");
                result
            }
            None => {
                info!(phone = %target.phone, timeout_secs = timeout_secs, "Menu timed out");
                MenuResult::timed_out(&target.phone, target.contact_id.as_deref().unwrap_or(""))
            }
        })
    }

    /// Send a question and register a pending expectation for the reply
    ///
    /// Returns `None` unless `wait` is set.
    pub async fn prompt(&self, args: PromptArgs) -> Result<Option<PromptResult>> {
        if args.message.trim().is_empty() {
            return Err(Error::Validation("prompt message is required".to_string()));
        }
        let options = args.options.into_vec();
        if args.reply_type == ReplyType::Choice && options.is_empty() {
            return Err(Error::Validation(
                "choice prompts need at least one option".to_string(),
            ));
        }
        let key = non_blank(&args.key).unwrap_or(DEFAULT_PROMPT_KEY).to_string();
        let ttl = args.ttl_seconds.unwrap_or(self.config.default_ttl_secs);
        let timeout = if args.wait {
            Some(check_wait(args.timeout.unwrap_or(ttl))?)
        } else {
            None
        };

        let target = self.resolve(&args.to).await?;
        let listener = timeout.map(|_| self.bus.listen(EventKind::ReplyParsed));

        self.api.send_sms(&target.phone, &args.message).await?;
        self.emit_sent(&target, SendKind::Sms);

        let expectation = PendingExpectation {
            options,
            ..PendingExpectation::new(args.reply_type.clone(), ttl)
        }
        .with_regex(args.regex.clone())
        .with_response_variable(args.response_variable.clone());
        self.store.set_pending(&target.phone, &key, expectation).await?;
        info!(phone = %target.phone, key = %key, reply_type = %args.reply_type, "Sent prompt");

        let (Some(timeout), Some((subscription, mut rx))) = (timeout, listener) else {
            return Ok(None);
        };
        let reply = wait_for_reply(&mut rx, &target.phone, &key, timeout).await;
        subscription.unsubscribe();

        Ok(Some(match reply {
            Some(reply) => PromptResult {
                key: reply.key,
                value: Some(reply.value),
                raw_text: reply.raw_text,
                option_index: reply.option_index,
                response_number: Some(reply.response_number),
                response_variable: reply.response_variable,
                phone: reply.phone,
                contact_id: reply.contact_id,
                timed_out: false,
            },
            None => PromptResult {
                key,
                value: None,
                raw_text: String::new(),
                option_index: None,
                response_number: None,
                response_variable: args.response_variable,
                phone: target.phone.clone(),
                contact_id: target.contact_or_phone().to_string(),
                timed_out: true,
            },
        }))
    }

    /// Remove pending expectations; returns how many were removed
    pub async fn clear_pending(&self, args: ClearPendingArgs) -> Result<usize> {
        let target = self.resolve(&args.to).await?;
        let removed = self
            .store
            .clear_pending(&target.phone, non_blank(&args.key))
            .await?;
        debug!(phone = %target.phone, removed = removed, "Cleared pending");
        Ok(removed)
    }

    /// Merge keys into the recipient's context
    pub async fn set_context(&self, args: SetContextArgs) -> Result<()> {
        if args.context.is_empty() {
            return Err(Error::Validation("context must not be empty".to_string()));
        }
        let target = self.resolve(&args.to).await?;
        self.store.merge_context(&target.phone, args.context).await
    }

    /// Add a contact, deriving a unique id from the name
    pub async fn add_contact(&self, name: &str, phone: &str) -> Result<Contact> {
        let (name, phone) = validate_contact(name, phone)?;
        let base = contact_slug(&name);

        let contact = self
            .store
            .mutate(|doc| {
                let mut id = base.clone();
                let mut counter = 1;
                while doc.contacts.contains_key(&id) {
                    id = format!("{}_{}", base, counter);
                    counter += 1;
                }
                doc.contacts.insert(
                    id.clone(),
                    ContactRecord {
                        name: name.clone(),
                        phone: phone.clone(),
                    },
                );
                Contact { id, name, phone }
            })
            .await?;

        info!(contact_id = %contact.id, phone = %contact.phone, "Added contact");
        self.bus.emit(Event::ContactAdded(ContactChanged {
            contact_id: contact.id.clone(),
            name: contact.name.clone(),
            phone: contact.phone.clone(),
        }));
        Ok(contact)
    }

    pub async fn update_contact(&self, contact_id: &str, name: &str, phone: &str) -> Result<Contact> {
        let (name, phone) = validate_contact(name, phone)?;

        let updated = self
            .store
            .mutate(|doc| {
                let record = doc.contacts.get_mut(contact_id)?;
                record.name = name.clone();
                record.phone = phone.clone();
                Some(())
            })
            .await?;
        if updated.is_none() {
            return Err(Error::ContactNotFound(contact_id.to_string()));
        }

        info!(contact_id = contact_id, phone = %phone, "Updated contact");
        self.bus.emit(Event::ContactUpdated(ContactChanged {
            contact_id: contact_id.to_string(),
            name: name.clone(),
            phone: phone.clone(),
        }));
        Ok(Contact {
            id: contact_id.to_string(),
            name,
            phone,
        })
    }

    /// Delete a contact along with its pending expectations and context
    pub async fn delete_contact(&self, contact_id: &str) -> Result<Contact> {
        let contact = self
            .store
            .delete_contact(contact_id)
            .await?
            .ok_or_else(|| Error::ContactNotFound(contact_id.to_string()))?;

        info!(contact_id = contact_id, "Deleted contact");
        self.bus.emit(Event::ContactDeleted(ContactDeleted {
            contact_id: contact_id.to_string(),
        }));
        Ok(contact)
    }

    async fn resolve(&self, to: &Recipient) -> Result<Target> {
        let by_id = non_blank(&to.contact_from_trigger).or_else(|| non_blank(&to.contact_id));

        if let Some(id) = by_id {
            let id = id.strip_prefix(ENTITY_PREFIX).unwrap_or(id);
            let contact = self
                .store
                .contact(id)
                .await?
                .ok_or_else(|| Error::ContactNotFound(id.to_string()))?;
            return Ok(Target {
                phone: contact.phone,
                contact_id: Some(contact.id),
            });
        }

        if let Some(raw) = non_blank(&to.phone) {
            let phone = format_phone(raw)?;
            let contact_id = self.store.contact_by_phone(&phone).await?.map(|c| c.id);
            return Ok(Target { phone, contact_id });
        }

        Err(Error::Validation(
            "one of contact_from_trigger, contact_id or phone is required".to_string(),
        ))
    }

    /// Map an attachment path to a file and read it
    ///
    /// `/local/x` and relative paths live under the media directory.
    async fn read_attachment(&self, raw: &str) -> Result<(Vec<u8>, String)> {
        let path = attachment_path(&self.config.media_dir, raw);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "Could not read attachment");
            Error::Validation(format!("cannot read attachment {}: {}", raw, e))
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok((bytes, filename))
    }

    fn emit_sent(&self, target: &Target, kind: SendKind) {
        self.bus.emit(Event::MessageSent(MessageSent {
            phone: target.phone.clone(),
            contact_id: target.contact_id.clone(),
            kind,
            timestamp: Utc::now(),
        }));
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| Error::Validation(e.to_string()))
}

fn required_id(args: &ContactArgs) -> Result<&str> {
    non_blank(&args.id).ok_or_else(|| Error::Validation("contact id is required".to_string()))
}

fn validate_contact(name: &str, phone: &str) -> Result<(String, String)> {
    let name = name.trim();
    if name.is_empty() || phone.trim().is_empty() {
        return Err(Error::Validation("name and phone are required".to_string()));
    }
    Ok((name.to_string(), format_phone(phone)?))
}

fn attachment_path(media_dir: &Path, raw: &str) -> PathBuf {
    let normalized = raw.trim().replace('\\', "/");
    if let Some(rest) = normalized.strip_prefix("/local/") {
        return media_dir.join(rest.trim_start_matches('/'));
    }
    let path = PathBuf::from(&normalized);
    if path.is_absolute() {
        path
    } else {
        media_dir.join(path)
    }
}
