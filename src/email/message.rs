use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reference to an attachment; the payload itself lives in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// A single received message.
///
/// Everything except `is_read` and `is_archived` is fixed once the message
/// has been received; those two flags only change through explicit user
/// action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        subject: impl Into<String>,
        sender: impl Into<String>,
        recipients: Vec<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            subject: subject.into(),
            sender: sender.into(),
            recipients,
            preview: String::new(),
            body: String::new(),
            received_at,
            is_read: false,
            is_archived: false,
            attachments: Vec::new(),
        }
    }

    /// Set the body, deriving the preview from its first line
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.preview = make_preview(&self.body);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

const PREVIEW_LEN: usize = 120;

fn make_preview(body: &str) -> String {
    let first_line = body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    first_line.chars().take(PREVIEW_LEN).collect()
}

/// Server-side grouping of messages sharing a conversation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub subject: String,
    /// Messages in arrival order
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub participants: BTreeSet<String>,
    #[serde(default)]
    pub is_muted: bool,
}

impl Thread {
    /// Build a thread from its messages, collecting participants from every
    /// sender and recipient.
    pub fn new(id: impl Into<String>, subject: impl Into<String>, messages: Vec<Message>) -> Self {
        let participants = messages
            .iter()
            .flat_map(|m| std::iter::once(&m.sender).chain(m.recipients.iter()))
            .cloned()
            .collect();

        Self {
            id: id.into(),
            subject: subject.into(),
            messages,
            participants,
            is_muted: false,
        }
    }

    pub fn latest_received_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.received_at).max()
    }

    pub fn unread_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_read).count()
    }
}

/// Outgoing message handed to a mail service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: uuid::Uuid,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl Draft {
    pub fn new(to: Vec<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            to,
            cc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            in_reply_to: None,
        }
    }

    /// Reply to `message`: addressed to its sender, subject prefixed once
    pub fn reply_to(message: &Message, body: impl Into<String>) -> Self {
        let subject = if message.subject.to_lowercase().starts_with("re:") {
            message.subject.clone()
        } else {
            format!("Re: {}", message.subject)
        };

        let mut draft = Self::new(vec![message.sender.clone()], subject, body);
        draft.in_reply_to = Some(message.id.clone());
        draft
    }
}
