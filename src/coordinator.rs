//! Poll cycle: fetch → process → clean
//!
//! One cycle at a time per instance. Inbound messages are deduplicated by
//! vendor id, filtered by the allow-list, surfaced as `MessageReceived` and
//! matched against the sender's pending expectations.

use crate::client::{MessageDirection, RawMessage, VendorApi};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, MessageReceived, ReplyParsed};
use crate::parsing::parse_reply;
use crate::phone::canonical_or_raw;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The vendor list is always read from the start; the processed-id set dedups
const POLL_CURSOR: &str = "0";

/// Where the coordinator is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Processing,
    Cleaning,
}

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages returned by the vendor, any direction
    pub fetched: usize,
    /// New inbound messages surfaced as events
    pub received: usize,
    pub replies: usize,
    pub duplicates: usize,
    pub unauthorized: usize,
    pub malformed: usize,
    pub expired: usize,
}

enum Outcome {
    Received { replied: bool },
    Duplicate,
    Unauthorized,
    Malformed,
}

pub struct Coordinator {
    config: Arc<Config>,
    store: Arc<StateStore>,
    api: Arc<dyn VendorApi>,
    bus: EventBus,
    phase: Mutex<CyclePhase>,
    last_success: Mutex<Option<bool>>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
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
            phase: Mutex::new(CyclePhase::Idle),
            last_success: Mutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Outcome of the most recent cycle; `None` before the first one
    pub fn last_update_success(&self) -> Option<bool> {
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    /// Run one full cycle
    ///
    /// Any failure is reported as [`Error::UpdateFailed`]; state written
    /// before the failure is kept.
    pub async fn poll_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let result = self.run_cycle().await;
        self.set_phase(CyclePhase::Idle);
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(result.is_ok());

        match result {
            Ok(report) => {
                if report.received > 0 || report.expired > 0 {
                    info!(
                        received = report.received,
                        replies = report.replies,
                        expired = report.expired,
                        "Poll cycle complete"
                    );
                } else {
                    debug!(fetched = report.fetched, "Poll cycle complete, nothing new");
                }
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Poll cycle failed");
                Err(Error::UpdateFailed(e.to_string()))
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.set_phase(CyclePhase::Fetching);
        let messages = self.api.poll(POLL_CURSOR).await?;
        report.fetched = messages.len();

        self.set_phase(CyclePhase::Processing);
        for msg in messages
            .iter()
            .filter(|m| m.direction() == Some(MessageDirection::Inbound))
        {
            match self.process_message(msg).await {
                Ok(Outcome::Received { replied }) => {
                    report.received += 1;
                    report.replies += usize::from(replied);
                }
                Ok(Outcome::Duplicate) => report.duplicates += 1,
                Ok(Outcome::Unauthorized) => report.unauthorized += 1,
                Ok(Outcome::Malformed) => report.malformed += 1,
                Err(e) => {
                    warn!(message_id = ?msg.id(), error = %e, "Failed to process message, continuing");
                }
            }
        }

        self.set_phase(CyclePhase::Cleaning);
        report.expired = self.cleanup_expired(Utc::now()).await?;

        Ok(report)
    }

    async fn process_message(&self, msg: &RawMessage) -> Result<Outcome> {
        let Some(message_id) = msg.id() else {
            warn!(message = %msg.0, "Skipping inbound message without id");
            return Ok(Outcome::Malformed);
        };

        if self.store.is_processed(&message_id).await? {
            return Ok(Outcome::Duplicate);
        }

        let outcome = self.handle_new(&message_id, msg).await;
        // Marked whatever happened above so a bad message is not retried forever
        self.store.mark_processed(&message_id).await?;
        outcome
    }

    async fn handle_new(&self, message_id: &str, msg: &RawMessage) -> Result<Outcome> {
        let Some(sender) = msg.contact_value() else {
            warn!(message_id = message_id, "Skipping inbound message without sender");
            return Ok(Outcome::Malformed);
        };
        let phone = canonical_or_raw(sender);

        if !self.config.is_allowed(&phone) {
            warn!(phone = %phone, message_id = message_id, "Ignoring message from unauthorized number");
            return Ok(Outcome::Unauthorized);
        }

        let doc = self.store.load().await?;
        let contact_id = doc
            .contact_id_for_phone(&phone)
            .map(str::to_string)
            .unwrap_or_else(|| phone.clone());
        let text = msg.text().to_string();

        info!(phone = %phone, message_id = message_id, contact_id = %contact_id, "Received message");
        self.bus.emit(Event::MessageReceived(MessageReceived {
            phone: phone.clone(),
            text: text.clone(),
            message_id: message_id.to_string(),
            timestamp: msg.timestamp().unwrap_or_else(|| Utc::now().to_rfc3339()),
            contact_id: contact_id.clone(),
        }));

        let Some(pending) = doc.pending.get(&phone) else {
            return Ok(Outcome::Received { replied: false });
        };

        let now = Utc::now();
        for (key, expectation) in pending {
            // Expired but not yet cleaned up
            if expectation.is_expired(now) {
                continue;
            }
            let options =
                (!expectation.options.is_empty()).then_some(expectation.options.as_slice());
            let Some(parsed) = parse_reply(
                &text,
                &expectation.reply_type,
                options,
                expectation.regex.as_deref(),
            ) else {
                continue;
            };

            info!(
                phone = %phone,
                key = %key,
                reply_type = %parsed.reply_type,
                value = %parsed.value,
                "Reply matched pending expectation"
            );
            let response_number = parsed.response_number();
            // Cleared before emitting so a waiter can register a follow-up under the same key
            self.store.clear_pending(&phone, Some(key)).await?;
            self.bus.emit(Event::ReplyParsed(ReplyParsed {
                phone: phone.clone(),
                contact_id: contact_id.clone(),
                key: key.clone(),
                reply_type: parsed.reply_type,
                value: parsed.value,
                raw_text: parsed.raw_text,
                option_index: parsed.option_index,
                response_number,
                response_variable: expectation.response_variable.clone(),
            }));
            return Ok(Outcome::Received { replied: true });
        }

        debug!(phone = %phone, pending = pending.len(), "No pending expectation matched");
        Ok(Outcome::Received { replied: false })
    }

    /// Drop every expectation whose TTL has passed at `now`; no events are emitted
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.remove_expired(now).await?;
        for (phone, key) in &removed {
            debug!(phone = %phone, key = %key, "Pending expectation expired");
        }
        Ok(removed.len())
    }
}

/// Shortest accepted polling period
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run `poll_cycle` every `interval`, starting one interval from now
///
/// Intervals below [`MIN_POLL_INTERVAL`] are raised to it. Failed cycles are
/// logged and retried on the next tick. Abort the handle to stop.
pub fn spawn_polling(coordinator: Arc<Coordinator>, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(MIN_POLL_INTERVAL);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Polling started");
        loop {
            ticker.tick().await;
            // Errors are already logged by poll_cycle
            let _ = coordinator.poll_cycle().await;
        }
    })
}
