//! TextNow SMS bridge
//!
//! Polls a TextNow account, matches inbound replies against pending prompts,
//! and sends SMS, MMS, voice messages and numbered menus.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod integration;
pub mod parsing;
pub mod phone;
pub mod sensor;
pub mod services;
pub mod store;
pub mod trigger;

pub use error::{Error, Result};
