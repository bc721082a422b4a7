//! Mail service backed by an exported inbox on disk.
//!
//! The export is either a JSON array of threads (`*.json`) or one thread
//! per line (`*.jsonl`). Line-delimited exports are decoded lazily while
//! streaming, so a corrupt line surfaces as a mid-stream failure after the
//! threads before it were delivered.

use super::{Account, MailError, MailResult, MailService};
use crate::email::{Draft, Message, Thread};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct JsonMailService {
    account: Account,
    inbox_path: PathBuf,
    outbox_path: Option<PathBuf>,
    /// Pause between streamed threads, to mimic a slow provider
    stream_delay: Option<Duration>,
    authenticated: AtomicBool,
}

impl JsonMailService {
    pub fn new(account: Account, inbox_path: impl Into<PathBuf>) -> Self {
        Self {
            account,
            inbox_path: inbox_path.into(),
            outbox_path: None,
            stream_delay: None,
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn with_outbox(mut self, path: impl Into<PathBuf>) -> Self {
        self.outbox_path = Some(path.into());
        self
    }

    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = Some(delay);
        self
    }

    pub fn inbox_path(&self) -> &Path {
        &self.inbox_path
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn ensure_authenticated(&self) -> MailResult<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(MailError::NotAuthenticated)
        }
    }

    fn is_line_delimited(&self) -> bool {
        self.inbox_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false)
    }

    async fn read_export(&self) -> MailResult<String> {
        tokio::fs::read_to_string(&self.inbox_path).await.map_err(|e| {
            MailError::network(format!(
                "failed to read inbox export {}: {}",
                self.inbox_path.display(),
                e
            ))
        })
    }

    async fn load_inbox(&self) -> MailResult<Vec<Thread>> {
        let content = self.read_export().await?;
        if self.is_line_delimited() {
            parse_lines(&content).collect()
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}

fn parse_lines(content: &str) -> impl Iterator<Item = MailResult<Thread>> + '_ {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Thread>(line).map_err(MailError::from))
}

#[async_trait]
impl MailService for JsonMailService {
    async fn authenticate(&self) -> MailResult<Account> {
        if !tokio::fs::try_exists(&self.inbox_path).await? {
            return Err(MailError::authentication(format!(
                "no inbox export at {}",
                self.inbox_path.display()
            )));
        }

        self.authenticated.store(true, Ordering::Release);
        info!("Authenticated {} ({})", self.account.email, self.account.provider);

        let mut account = self.account.clone();
        account.authenticated_at = Some(Utc::now());
        Ok(account)
    }

    async fn restore_account(&self, account: &Account) -> MailResult<()> {
        if !account.email.eq_ignore_ascii_case(&self.account.email) {
            return Err(MailError::authentication(format!(
                "account {} does not belong to this service",
                account.email
            )));
        }

        self.authenticated.store(true, Ordering::Release);
        debug!("Restored account {}", account.email);
        Ok(())
    }

    async fn fetch_inbox(&self) -> MailResult<Vec<Thread>> {
        self.ensure_authenticated()?;
        let threads = self.load_inbox().await?;
        debug!("Fetched {} threads from {}", threads.len(), self.inbox_path.display());
        Ok(threads)
    }

    fn fetch_inbox_stream(&self) -> BoxStream<'_, MailResult<Thread>> {
        if let Err(e) = self.ensure_authenticated() {
            return stream::iter(vec![Err(e)]).boxed();
        }

        let delay = self.stream_delay;
        let line_delimited = self.is_line_delimited();

        stream::once(self.read_export())
            .flat_map(move |content| {
                let items: Vec<MailResult<Thread>> = match content {
                    Ok(content) if line_delimited => parse_lines(&content).collect(),
                    Ok(content) => match serde_json::from_str::<Vec<Thread>>(&content) {
                        Ok(threads) => threads.into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(e.into())],
                    },
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }

    async fn fetch_message(&self, id: &str) -> MailResult<Option<Message>> {
        self.ensure_authenticated()?;
        let threads = self.load_inbox().await?;
        Ok(threads
            .into_iter()
            .flat_map(|t| t.messages.into_iter())
            .find(|m| m.id == id))
    }

    async fn send(&self, draft: &Draft) -> MailResult<()> {
        self.ensure_authenticated()?;

        if draft.to.is_empty() {
            return Err(MailError::send("draft has no recipients"));
        }

        let outbox = self
            .outbox_path
            .as_ref()
            .ok_or_else(|| MailError::send("no outbox configured"))?;

        let mut line = serde_json::to_string(draft)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(outbox)
            .await
            .map_err(|e| {
                warn!("Failed to open outbox {}: {}", outbox.display(), e);
                MailError::send(e.to_string())
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        info!("Queued message {} to {}", draft.id, draft.to.join(", "));
        Ok(())
    }
}
