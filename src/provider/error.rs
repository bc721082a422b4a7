use std::io;
use thiserror::Error;

pub type MailResult<T> = Result<T, MailError>;

/// Mail service errors
#[derive(Error, Debug)]
pub enum MailError {
    /// Credentials rejected or account cannot be restored
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transport failure talking to the provider
    #[error("Network error: {0}")]
    Network(String),

    /// Outgoing message rejected
    #[error("Send failed: {0}")]
    Send(String),

    /// Operation requires an authenticated account
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Provider payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl MailError {
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        MailError::Authentication(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        MailError::Network(msg.into())
    }

    pub fn send<S: Into<String>>(msg: S) -> Self {
        MailError::Send(msg.into())
    }

    /// Authentication problems need user action; everything else is retried
    /// by the next poll.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, MailError::Authentication(_) | MailError::NotAuthenticated)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Network(_) | MailError::Io(_))
    }
}
