//! Regrouping of server threads into display conversations.
//!
//! Standard messages are grouped by the other party of the exchange
//! (the counterpart). Threads the user has promoted are grouped by thread
//! id and labelled with their topic instead.

use crate::email::message::{Message, Thread};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const TOPIC_PREFIX: &str = "Topic: ";
const UNKNOWN_TOPIC: &str = "Unknown Topic";

/// Presentation-only grouping of messages. Never persisted; rebuilt on
/// every regroup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    /// Counterpart address, or thread id for promoted threads
    pub id: String,
    pub label: String,
    /// Messages ascending by `received_at`
    pub messages: Vec<Message>,
    pub is_topic: bool,
}

impl Conversation {
    pub fn latest_received_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|m| m.received_at)
    }

    pub fn latest_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn unread_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_read).count()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Inputs that decide how messages are partitioned and ordered
#[derive(Debug, Clone, Default)]
pub struct GroupingContext {
    /// Address of the account owner
    pub own_address: String,
    pub promoted_threads: HashSet<String>,
    pub pinned_conversations: HashSet<String>,
}

impl GroupingContext {
    pub fn new(own_address: impl Into<String>) -> Self {
        Self {
            own_address: own_address.into(),
            ..Default::default()
        }
    }

    pub fn with_promoted<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.promoted_threads = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pinned<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pinned_conversations = ids.into_iter().map(Into::into).collect();
        self
    }

    fn is_own(&self, address: &str) -> bool {
        !self.own_address.is_empty()
            && address
                .to_lowercase()
                .contains(&self.own_address.to_lowercase())
    }

    /// Group key for a message that is not part of a promoted thread.
    ///
    /// Mail sent by the owner groups under the first recipient that is not
    /// the owner, then the first recipient, then the sender. Mail from
    /// anyone else groups under its sender.
    pub fn counterpart_key<'a>(&self, message: &'a Message) -> &'a str {
        if !self.is_own(&message.sender) {
            return &message.sender;
        }

        message
            .recipients
            .iter()
            .find(|r| !self.is_own(r))
            .or_else(|| message.recipients.first())
            .map(String::as_str)
            .unwrap_or(message.sender.as_str())
    }
}

/// Builds the ordered conversation list from a set of cached threads
pub fn group_conversations(threads: &[Thread], ctx: &GroupingContext) -> Vec<Conversation> {
    // Insertion-ordered groups keep the result deterministic for equal sort keys
    let mut conversations: Vec<Conversation> = Vec::new();
    let mut index: HashMap<(bool, String), usize> = HashMap::new();

    for message in threads.iter().flat_map(|t| t.messages.iter()) {
        let is_topic = ctx.promoted_threads.contains(&message.thread_id);
        let key = if is_topic {
            message.thread_id.clone()
        } else {
            ctx.counterpart_key(message).to_string()
        };

        let slot = *index.entry((is_topic, key.clone())).or_insert_with(|| {
            let label = if is_topic {
                topic_label(&message.subject)
            } else {
                key.clone()
            };
            conversations.push(Conversation {
                id: key,
                label,
                messages: Vec::new(),
                is_topic,
            });
            conversations.len() - 1
        });

        conversations[slot].messages.push(message.clone());
    }

    for conversation in &mut conversations {
        conversation.messages.sort_by_key(|m| m.received_at);
    }

    sort_conversations(&mut conversations, &ctx.pinned_conversations);
    conversations
}

fn topic_label(subject: &str) -> String {
    if subject.trim().is_empty() {
        UNKNOWN_TOPIC.to_string()
    } else {
        format!("{}{}", TOPIC_PREFIX, subject)
    }
}

/// Pinned first, then most recent activity first. Empty conversations go last.
pub fn sort_conversations(conversations: &mut [Conversation], pinned: &HashSet<String>) {
    conversations.sort_by(|a, b| {
        let a_pinned = pinned.contains(&a.id);
        let b_pinned = pinned.contains(&b.id);

        b_pinned
            .cmp(&a_pinned)
            .then_with(|| compare_recency(a.latest_received_at(), b.latest_received_at()))
    });
}

fn compare_recency(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Merge `incoming` into `cache` by thread id: replace in place when the id
/// is already cached, append otherwise. Returns true when the thread was new.
///
/// Read and archived flags already set on a cached message survive the
/// replacement, matching the store upsert.
pub fn merge_thread(cache: &mut Vec<Thread>, mut incoming: Thread) -> bool {
    match cache.iter_mut().find(|t| t.id == incoming.id) {
        Some(existing) => {
            for message in &mut incoming.messages {
                if let Some(cached) = existing.messages.iter().find(|m| m.id == message.id) {
                    message.is_read |= cached.is_read;
                    message.is_archived |= cached.is_archived;
                }
            }
            *existing = incoming;
            false
        }
        None => {
            cache.push(incoming);
            true
        }
    }
}
