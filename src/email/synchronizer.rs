//! Per-account conversation synchronizer.
//!
//! Polls the account's [`MailService`], merges fetched threads into a
//! working cache and the [`LocalStore`], and republishes the grouped
//! conversation list after every merge. At most one sync pass runs per
//! account: a trigger arriving while a pass is in flight is dropped.

use crate::email::conversation::{group_conversations, merge_thread, Conversation, GroupingContext};
use crate::email::database::{LocalStore, StoreError};
use crate::email::message::Thread;
use crate::provider::{Account, MailError, MailService};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Synchronizer errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Mail(#[from] MailError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// How the inbox is pulled from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Whole inbox in one call; fails without partial results
    Batch,
    /// Thread by thread, republishing after each one
    #[default]
    Streaming,
}

/// Shortest accepted poll interval; shorter values are raised to it
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub fetch_mode: FetchMode,
    /// Fire the first poll immediately instead of after one interval
    pub sync_on_startup: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            fetch_mode: FetchMode::Streaming,
            sync_on_startup: true,
        }
    }
}

/// Observable state consumed by the presentation layer
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub conversations: Arc<Vec<Conversation>>,
    pub is_loading: bool,
    pub progress: Option<String>,
    pub error: Option<String>,
    pub selected_conversation: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result of a sync trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was already in flight
    Skipped,
    Completed { threads: usize, conversations: usize },
}

#[derive(Debug, Default)]
struct Preferences {
    promoted: HashSet<String>,
    pinned: HashSet<String>,
}

pub struct ConversationSynchronizer {
    account: Account,
    service: Arc<dyn MailService>,
    store: Arc<dyn LocalStore>,
    options: SyncOptions,
    threads: Mutex<Vec<Thread>>,
    prefs: RwLock<Preferences>,
    in_flight: AtomicBool,
    state_tx: watch::Sender<SyncState>,
}

/// Clears the single-flight flag and loading state however the pass ends,
/// including cancellation of the owning task.
struct InFlightGuard<'a> {
    sync: &'a ConversationSynchronizer,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.sync.state_tx.send_modify(|state| {
            state.is_loading = false;
            state.progress = None;
        });
        self.sync.in_flight.store(false, Ordering::Release);
    }
}

impl ConversationSynchronizer {
    pub fn new(
        account: Account,
        service: Arc<dyn MailService>,
        store: Arc<dyn LocalStore>,
        mut options: SyncOptions,
    ) -> Self {
        if options.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} for {} is below {:?}, clamping",
                options.poll_interval, account.email, MIN_POLL_INTERVAL
            );
            options.poll_interval = MIN_POLL_INTERVAL;
        }

        let (state_tx, _) = watch::channel(SyncState::default());
        Self {
            account,
            service,
            store,
            options,
            threads: Mutex::new(Vec::new()),
            prefs: RwLock::new(Preferences::default()),
            in_flight: AtomicBool::new(false),
            state_tx,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn account_key(&self) -> &str {
        self.account.store_key()
    }

    /// Receiver that observes every published state change
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn conversations(&self) -> Arc<Vec<Conversation>> {
        Arc::clone(&self.state_tx.borrow().conversations)
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Seed the working cache and preferences from the local store and
    /// publish the grouped result, without touching the network.
    pub async fn load_cached(&self) -> SyncResult<usize> {
        let key = self.account_key();
        let cached = self.store.fetch_threads(key).await?;
        let pinned = self.store.pinned_conversations(key).await?;
        let promoted = self.store.promoted_threads(key).await?;
        let last_sync = self.store.get_last_sync_date(key).await?;

        {
            let mut prefs = self.prefs.write().await;
            prefs.pinned = pinned;
            prefs.promoted = promoted;
        }

        let count = {
            let mut threads = self.threads.lock().await;
            for thread in cached {
                merge_thread(&mut threads, thread);
            }
            threads.len()
        };

        self.state_tx.send_modify(|state| state.last_synced_at = last_sync);
        self.regroup().await;

        info!("Loaded {} cached threads for {}", count, key);
        Ok(count)
    }

    /// Incremental sync pass. Dropped when a pass is already running.
    pub async fn refresh(&self) -> SyncResult<SyncOutcome> {
        self.run_pass(false).await
    }

    /// Discard the working thread cache and fetch everything again
    pub async fn reload(&self) -> SyncResult<SyncOutcome> {
        self.run_pass(true).await
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        self.state_tx.send_modify(|state| state.is_loading = true);
        Some(InFlightGuard { sync: self })
    }

    async fn run_pass(&self, discard_cache: bool) -> SyncResult<SyncOutcome> {
        let Some(_guard) = self.try_begin() else {
            debug!("Sync already in flight for {}, dropping trigger", self.account_key());
            return Ok(SyncOutcome::Skipped);
        };

        if discard_cache {
            self.threads.lock().await.clear();
            info!("Discarded working thread cache for {}", self.account_key());
        }

        let result = match self.options.fetch_mode {
            FetchMode::Batch => self.fetch_batch().await,
            FetchMode::Streaming => self.fetch_streaming().await,
        };

        match result {
            Ok(threads) => {
                let now = Utc::now();
                if let Err(e) = self.store.update_last_sync_date(now, self.account_key()).await {
                    let e = SyncError::from(e);
                    self.publish_error(&e);
                    return Err(e);
                }

                let conversations = self.state_tx.borrow().conversations.len();
                self.state_tx.send_modify(|state| {
                    state.error = None;
                    state.last_synced_at = Some(now);
                });

                info!(
                    "Synced {}: {} threads, {} conversations",
                    self.account_key(),
                    threads,
                    conversations
                );
                Ok(SyncOutcome::Completed { threads, conversations })
            }
            Err(e) => {
                self.publish_error(&e);
                Err(e)
            }
        }
    }

    /// Whole inbox or nothing. Returns the number of threads fetched.
    async fn fetch_batch(&self) -> SyncResult<usize> {
        let fetched = self.service.fetch_inbox().await?;
        let count = fetched.len();

        let mut store_error = None;
        for thread in &fetched {
            if let Err(e) = self.persist(thread).await {
                store_error.get_or_insert(e);
            }
        }

        {
            let mut threads = self.threads.lock().await;
            for thread in fetched {
                merge_thread(&mut threads, thread);
            }
        }
        self.regroup_with_progress().await;

        match store_error {
            Some(e) => Err(e.into()),
            None => Ok(count),
        }
    }

    /// Merge and republish one thread at a time. On failure everything
    /// merged so far stays in place.
    async fn fetch_streaming(&self) -> SyncResult<usize> {
        let mut stream = self.service.fetch_inbox_stream();
        let mut count = 0;
        let mut store_error = None;

        while let Some(item) = stream.next().await {
            let thread = item?;

            if let Err(e) = self.persist(&thread).await {
                store_error.get_or_insert(e);
            }

            merge_thread(&mut *self.threads.lock().await, thread);
            count += 1;
            self.regroup_with_progress().await;
        }

        match store_error {
            Some(e) => Err(e.into()),
            None => Ok(count),
        }
    }

    async fn persist(&self, thread: &Thread) -> Result<(), StoreError> {
        self.store
            .save_thread(thread, self.account_key())
            .await
            .map_err(|e| {
                warn!("Failed to cache thread {} for {}: {}", thread.id, self.account_key(), e);
                e
            })
    }

    fn publish_error(&self, e: &SyncError) {
        let message = match e {
            SyncError::Mail(mail) if mail.is_auth_error() => {
                format!("Sign in again to {}: {}", self.account.email, mail)
            }
            other => other.to_string(),
        };

        match e {
            SyncError::Mail(mail) if mail.is_transient() => {
                warn!("Sync failed for {}, retrying next poll: {}", self.account_key(), message)
            }
            _ => error!("Sync failed for {}: {}", self.account_key(), message),
        }
        self.state_tx.send_modify(|state| state.error = Some(message));
    }

    async fn grouping_context(&self) -> GroupingContext {
        let prefs = self.prefs.read().await;
        GroupingContext {
            own_address: self.account.email.clone(),
            promoted_threads: prefs.promoted.clone(),
            pinned_conversations: prefs.pinned.clone(),
        }
    }

    async fn build_conversations(&self) -> Vec<Conversation> {
        let ctx = self.grouping_context().await;
        let threads = self.threads.lock().await;
        group_conversations(&threads, &ctx)
    }

    /// Rebuild and atomically replace the published conversation list
    pub async fn regroup(&self) {
        let conversations = Arc::new(self.build_conversations().await);
        self.state_tx.send_modify(|state| state.conversations = conversations);
    }

    async fn regroup_with_progress(&self) {
        let conversations = Arc::new(self.build_conversations().await);
        let progress = format!("Loading {} conversations...", conversations.len());
        self.state_tx.send_modify(|state| {
            state.conversations = conversations;
            state.progress = Some(progress);
        });
    }

    pub async fn pin(&self, conversation_id: &str) -> SyncResult<()> {
        self.set_pinned(conversation_id, true).await
    }

    pub async fn unpin(&self, conversation_id: &str) -> SyncResult<()> {
        self.set_pinned(conversation_id, false).await
    }

    async fn set_pinned(&self, conversation_id: &str, pinned: bool) -> SyncResult<()> {
        self.store
            .set_pinned(conversation_id, pinned, self.account_key())
            .await?;
        {
            let mut prefs = self.prefs.write().await;
            if pinned {
                prefs.pinned.insert(conversation_id.to_string());
            } else {
                prefs.pinned.remove(conversation_id);
            }
        }
        self.regroup().await;
        Ok(())
    }

    pub async fn promote_thread(&self, thread_id: &str) -> SyncResult<()> {
        self.set_promoted(thread_id, true).await
    }

    pub async fn demote_thread(&self, thread_id: &str) -> SyncResult<()> {
        self.set_promoted(thread_id, false).await
    }

    async fn set_promoted(&self, thread_id: &str, promoted: bool) -> SyncResult<()> {
        self.store
            .set_promoted(thread_id, promoted, self.account_key())
            .await?;
        {
            let mut prefs = self.prefs.write().await;
            if promoted {
                prefs.promoted.insert(thread_id.to_string());
            } else {
                prefs.promoted.remove(thread_id);
            }
        }
        self.regroup().await;
        Ok(())
    }

    pub fn select_conversation(&self, conversation_id: Option<String>) {
        self.state_tx
            .send_modify(|state| state.selected_conversation = conversation_id);
    }

    /// Mark every unread message of a conversation as read. Returns how many
    /// messages changed.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> SyncResult<usize> {
        let unread: Vec<String> = self
            .conversations()
            .iter()
            .filter(|c| c.id == conversation_id)
            .flat_map(|c| c.messages.iter())
            .filter(|m| !m.is_read)
            .map(|m| m.id.clone())
            .collect();

        for id in &unread {
            self.store.update_read_status(id, true, self.account_key()).await?;
        }

        {
            let mut threads = self.threads.lock().await;
            for message in threads.iter_mut().flat_map(|t| t.messages.iter_mut()) {
                if unread.contains(&message.id) {
                    message.is_read = true;
                }
            }
        }

        self.regroup().await;
        debug!("Marked {} messages read in {}", unread.len(), conversation_id);
        Ok(unread.len())
    }

    pub async fn set_message_archived(&self, message_id: &str, archived: bool) -> SyncResult<()> {
        self.store
            .update_archive_status(message_id, archived, self.account_key())
            .await?;

        {
            let mut threads = self.threads.lock().await;
            if let Some(message) = threads
                .iter_mut()
                .flat_map(|t| t.messages.iter_mut())
                .find(|m| m.id == message_id)
            {
                message.is_archived = archived;
            }
        }

        self.regroup().await;
        Ok(())
    }

    /// Threads in the local store whose subject contains `query`
    pub async fn search(&self, query: &str) -> SyncResult<Vec<Thread>> {
        Ok(self.store.search_threads(query, self.account_key()).await?)
    }

    /// Drop this account's cached mail, in memory and on disk
    pub async fn clear_cache(&self) -> SyncResult<()> {
        self.store.clear_cache(self.account_key()).await?;
        self.threads.lock().await.clear();
        self.state_tx.send_modify(|state| state.last_synced_at = None);
        self.regroup().await;
        Ok(())
    }
}

/// Owns the polling task of one synchronizer. Dropping the handle stops
/// polling.
pub struct SyncHandle {
    synchronizer: Arc<ConversationSynchronizer>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Start polling at the synchronizer's configured interval. The first
    /// poll is immediate when `sync_on_startup` is set.
    pub fn spawn(synchronizer: Arc<ConversationSynchronizer>) -> Self {
        let immediate = synchronizer.options.sync_on_startup;
        Self::spawn_with_first_tick(synchronizer, immediate)
    }

    /// Like [`SyncHandle::spawn`], but `immediate` alone decides whether the
    /// first poll fires now or after one interval.
    pub fn spawn_with_first_tick(synchronizer: Arc<ConversationSynchronizer>, immediate: bool) -> Self {
        let period = synchronizer.options.poll_interval;
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };

        let worker = Arc::clone(&synchronizer);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match worker.refresh().await {
                    Ok(SyncOutcome::Skipped) => debug!("Scheduled sync skipped, pass in flight"),
                    Ok(SyncOutcome::Completed { .. }) => {}
                    // Already published to the state; the next tick retries
                    Err(e) => debug!("Scheduled sync failed: {}", e),
                }
            }
        });

        info!(
            "Started polling {} every {:?}",
            synchronizer.account.email, period
        );
        Self { synchronizer, task }
    }

    pub fn synchronizer(&self) -> &Arc<ConversationSynchronizer> {
        &self.synchronizer
    }

    /// Explicit reload trigger, guarded like the timer
    pub async fn reload(&self) -> SyncResult<SyncOutcome> {
        self.synchronizer.reload().await
    }

    pub fn shutdown(self) {
        info!("Stopped polling {}", self.synchronizer.account.email);
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
