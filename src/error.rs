//! Error types for textnow-bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing caller input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    /// Vendor rejected a send request
    #[error("Send failed ({status}): {body}")]
    Send { status: u16, body: String },

    /// Network failure talking to the vendor
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// A poll cycle failed; reported to the scheduler for health tracking
    #[error("Update failed: {0}")]
    UpdateFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// True for errors caused by the caller's input rather than the vendor or network
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidPhone(_) | Error::ContactNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
