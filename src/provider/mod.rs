//! Mail provider abstraction.
//!
//! The synchronizer only talks to a provider through [`MailService`]. Each
//! account owns its own service instance.

pub mod error;
pub mod json;

pub use error::{MailError, MailResult};
pub use json::JsonMailService;

use crate::email::{Draft, Message, Thread};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote mail provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    #[default]
    Local,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gmail => write!(f, "Gmail"),
            Provider::Outlook => write!(f, "Outlook"),
            Provider::Local => write!(f, "Local"),
        }
    }
}

/// An authenticated mail account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub provider: Provider,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub authenticated_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(email: impl Into<String>, provider: Provider) -> Self {
        Self {
            email: email.into(),
            provider,
            display_name: None,
            authenticated_at: None,
        }
    }

    /// Key used to partition cached data in the local store
    pub fn store_key(&self) -> &str {
        &self.email
    }
}

/// Capability surface of a remote mail provider
#[async_trait]
pub trait MailService: Send + Sync {
    async fn authenticate(&self) -> MailResult<Account>;

    /// Re-attach a previously authenticated account without prompting
    async fn restore_account(&self, account: &Account) -> MailResult<()>;

    /// Complete inbox, or an error with nothing returned
    async fn fetch_inbox(&self) -> MailResult<Vec<Thread>>;

    /// Inbox threads one at a time. The stream is finite and may end with
    /// an error after yielding some threads.
    fn fetch_inbox_stream(&self) -> BoxStream<'_, MailResult<Thread>> {
        stream::once(self.fetch_inbox())
            .flat_map(|result| match result {
                Ok(threads) => stream::iter(threads.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::iter(vec![Err(e)]).right_stream(),
            })
            .boxed()
    }

    async fn fetch_message(&self, id: &str) -> MailResult<Option<Message>>;

    async fn send(&self, draft: &Draft) -> MailResult<()>;
}
