use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::commands::CommandRegistry;
use crate::config::AppConfig;
use crate::email::{
    Conversation, ConversationSynchronizer, Draft, FetchMode, LocalStore, SqliteStore, SyncHandle,
    SyncOptions, SyncOutcome, SyncState, Thread,
};
use crate::provider::{JsonMailService, MailService};

/// Conversa - conversation-grouped mail synchronizer
#[derive(Parser)]
#[command(name = "conversa")]
#[command(about = "Groups your inbox into conversations and keeps it in sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Account email to operate on (defaults to the configured default)
    #[arg(short, long, global = true)]
    pub account: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll the inbox until interrupted, or sync once
    Sync(SyncArgs),

    /// List cached conversations
    Conversations {
        /// Show at most this many conversations
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only conversations with unread messages
        #[arg(long)]
        unread: bool,

        /// Print every message of each conversation
        #[arg(long)]
        full: bool,
    },

    /// Search cached threads by subject
    Search {
        query: String,
    },

    /// Pin a conversation to the top of the list
    Pin {
        conversation_id: String,
    },

    /// Remove a conversation pin
    Unpin {
        conversation_id: String,
    },

    /// Split a thread out into its own topic conversation
    Promote {
        thread_id: String,
    },

    /// Fold a topic thread back into its counterpart conversation
    Demote {
        thread_id: String,
    },

    /// Mark every message of a conversation as read
    MarkRead {
        conversation_id: String,
    },

    /// Archive a message
    Archive {
        message_id: String,

        /// Unarchive instead
        #[arg(long)]
        undo: bool,
    },

    /// Delete the cached mail of the account
    ClearCache,

    /// Show local store statistics
    Stats,

    /// Search the command palette
    #[command(name = "commands")]
    Palette {
        query: Option<String>,
    },

    /// Send a message, or reply to a cached one
    Send(SendArgs),

    /// Attachment payload cache
    Attachment(AttachmentArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FetchModeArg {
    Batch,
    Streaming,
}

impl From<FetchModeArg> for FetchMode {
    fn from(mode: FetchModeArg) -> Self {
        match mode {
            FetchModeArg::Batch => FetchMode::Batch,
            FetchModeArg::Streaming => FetchMode::Streaming,
        }
    }
}

#[derive(Args)]
pub struct SyncArgs {
    /// Run a single pass and exit
    #[arg(long)]
    pub once: bool,

    /// Discard the working cache before fetching
    #[arg(long)]
    pub reload: bool,

    /// Override the configured fetch mode
    #[arg(long, value_enum)]
    pub mode: Option<FetchModeArg>,

    /// Override the configured poll interval, in seconds
    #[arg(long)]
    pub interval: Option<u64>,
}

#[derive(Args)]
pub struct SendArgs {
    /// Recipient address (repeatable)
    #[arg(long = "to")]
    pub to: Vec<String>,

    #[arg(short, long, default_value = "")]
    pub subject: String,

    #[arg(short, long)]
    pub body: String,

    /// Reply to this cached message instead
    #[arg(long, conflicts_with_all = ["to", "subject"])]
    pub reply_to: Option<String>,
}

#[derive(Args)]
pub struct AttachmentArgs {
    #[command(subcommand)]
    pub command: AttachmentCommands,
}

#[derive(Subcommand)]
pub enum AttachmentCommands {
    /// Store a file as the payload of an attachment id
    Import {
        attachment_id: String,
        file: PathBuf,
    },

    /// Write a cached attachment payload to a file
    Export {
        attachment_id: String,
        output: PathBuf,
    },
}

impl Commands {
    /// Sync options for this invocation, starting from the configured ones
    pub fn sync_options(&self, config: &AppConfig) -> Result<SyncOptions> {
        let mut options = config.sync.to_options();

        if let Commands::Sync(args) = self {
            if let Some(mode) = args.mode {
                options.fetch_mode = mode.into();
            }
            if let Some(secs) = args.interval {
                if secs == 0 {
                    return Err(anyhow!("--interval must be positive"));
                }
                options.poll_interval = Duration::from_secs(secs);
            }
        }

        Ok(options)
    }
}

/// Print the command palette, optionally filtered
pub fn print_commands(query: Option<&str>) {
    let registry = CommandRegistry::with_defaults();

    match query {
        Some(query) => {
            let results = registry.search(query);
            if results.is_empty() {
                println!("No commands match '{}'", query);
            }
            for command in results {
                print_command_line(&command.title, &command.id, command.shortcut.as_deref());
            }
        }
        None => {
            for (category, commands) in registry.by_category() {
                println!("{}:", category);
                for command in commands {
                    print_command_line(&command.title, &command.id, command.shortcut.as_deref());
                }
                println!();
            }
        }
    }
}

fn print_command_line(title: &str, id: &str, shortcut: Option<&str>) {
    match shortcut {
        Some(key) => println!("  {:<32} {:<24} [{}]", title, id, key),
        None => println!("  {:<32} {}", title, id),
    }
}

/// Command-line interface handler bound to one account
pub struct CliHandler {
    synchronizer: Arc<ConversationSynchronizer>,
    store: Arc<SqliteStore>,
    service: Arc<JsonMailService>,
}

impl CliHandler {
    /// Open the store, sign in to the account and load its cached mail
    pub async fn new(config: &AppConfig, account: Option<&str>, options: SyncOptions) -> Result<Self> {
        let account_config = config.account(account)?;

        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create data directory {}", parent.display()))?;
        }
        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("Database path is not valid UTF-8: {}", db_path.display()))?;
        let store = Arc::new(SqliteStore::new(db_path).await?);

        let mut service = JsonMailService::new(account_config.to_account(), &account_config.inbox_path);
        if let Some(outbox) = &account_config.outbox_path {
            service = service.with_outbox(outbox);
        }
        if let Some(ms) = config.sync.stream_delay_ms {
            service = service.with_stream_delay(Duration::from_millis(ms));
        }
        let service = Arc::new(service);

        let account = service.authenticate().await?;
        let synchronizer = Arc::new(ConversationSynchronizer::new(
            account,
            Arc::clone(&service) as Arc<dyn MailService>,
            Arc::clone(&store) as Arc<dyn LocalStore>,
            options,
        ));
        synchronizer.load_cached().await?;

        debug!("CLI handler ready for {}", synchronizer.account().email);
        Ok(Self {
            synchronizer,
            store,
            service,
        })
    }

    pub fn synchronizer(&self) -> &Arc<ConversationSynchronizer> {
        &self.synchronizer
    }

    fn account_key(&self) -> &str {
        self.synchronizer.account().store_key()
    }

    /// Handle CLI commands
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Sync(args) => self.handle_sync(args).await,
            Commands::Conversations { limit, unread, full } => {
                self.handle_conversations(limit, unread, full);
                Ok(())
            }
            Commands::Search { query } => self.handle_search(&query).await,
            Commands::Pin { conversation_id } => {
                self.synchronizer.pin(&conversation_id).await?;
                println!("Pinned {}", conversation_id);
                Ok(())
            }
            Commands::Unpin { conversation_id } => {
                self.synchronizer.unpin(&conversation_id).await?;
                println!("Unpinned {}", conversation_id);
                Ok(())
            }
            Commands::Promote { thread_id } => {
                self.synchronizer.promote_thread(&thread_id).await?;
                println!("Thread {} is now its own topic", thread_id);
                Ok(())
            }
            Commands::Demote { thread_id } => {
                self.synchronizer.demote_thread(&thread_id).await?;
                println!("Thread {} folded back into its conversation", thread_id);
                Ok(())
            }
            Commands::MarkRead { conversation_id } => {
                let changed = self.synchronizer.mark_conversation_read(&conversation_id).await?;
                println!("Marked {} messages read in {}", changed, conversation_id);
                Ok(())
            }
            Commands::Archive { message_id, undo } => {
                self.synchronizer.set_message_archived(&message_id, !undo).await?;
                println!("{} {}", if undo { "Unarchived" } else { "Archived" }, message_id);
                Ok(())
            }
            Commands::ClearCache => {
                self.synchronizer.clear_cache().await?;
                println!("Cleared cached mail for {}", self.account_key());
                Ok(())
            }
            Commands::Stats => self.handle_stats().await,
            Commands::Palette { query } => {
                print_commands(query.as_deref());
                Ok(())
            }
            Commands::Send(args) => self.handle_send(args).await,
            Commands::Attachment(args) => self.handle_attachment(args).await,
        }
    }

    async fn handle_sync(&self, args: SyncArgs) -> Result<()> {
        if args.once {
            let outcome = if args.reload {
                self.synchronizer.reload().await
            } else {
                self.synchronizer.refresh().await
            };

            match outcome {
                Ok(SyncOutcome::Completed { threads, conversations }) => {
                    println!("Fetched {} threads into {} conversations", threads, conversations);
                }
                Ok(SyncOutcome::Skipped) => println!("A sync is already running"),
                Err(e) => {
                    let state = self.synchronizer.snapshot();
                    return Err(anyhow!(state.error.unwrap_or_else(|| e.to_string())));
                }
            }
            return Ok(());
        }

        // A reload just fetched everything, so the first poll waits an interval
        let immediate = !args.reload && self.synchronizer.options().sync_on_startup;
        if args.reload {
            // Failure is already published to the state
            if let Err(e) = self.synchronizer.reload().await {
                eprintln!("Sync error: {}", e);
            }
        }
        let handle = SyncHandle::spawn_with_first_tick(Arc::clone(&self.synchronizer), immediate);

        let mut rx = self.synchronizer.subscribe();
        let mut last_error: Option<String> = None;

        println!(
            "Polling {} every {}s, press Ctrl-C to stop",
            self.account_key(),
            self.synchronizer.options().poll_interval.as_secs()
        );

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = rx.borrow_and_update().clone();
                    report_state(&state, &mut last_error);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping sync");
                    break;
                }
            }
        }

        handle.shutdown();
        Ok(())
    }

    fn handle_conversations(&self, limit: Option<usize>, unread: bool, full: bool) {
        let state = self.synchronizer.snapshot();
        let conversations: Vec<&Conversation> = state
            .conversations
            .iter()
            .filter(|c| !unread || c.unread_count() > 0)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        if conversations.is_empty() {
            println!("No conversations cached for {}", self.account_key());
            return;
        }

        for conversation in conversations {
            print_conversation(conversation);
            if full {
                for message in &conversation.messages {
                    println!(
                        "      {}  {:<28} {}",
                        message.received_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                        message.sender,
                        message.subject
                    );
                }
            }
        }

        if let Some(at) = state.last_synced_at {
            println!("\nLast synced {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
        }
    }

    async fn handle_search(&self, query: &str) -> Result<()> {
        let threads = self.synchronizer.search(query).await?;
        if threads.is_empty() {
            println!("No threads match '{}'", query);
            return Ok(());
        }

        for thread in &threads {
            print_thread(thread);
        }
        Ok(())
    }

    async fn handle_stats(&self) -> Result<()> {
        let stats = self.store.get_stats(self.account_key()).await?;
        let state = self.synchronizer.snapshot();

        println!("Local store: {}", self.store.path());
        println!("   Account: {}", self.account_key());
        println!("   Threads: {}", stats.thread_count);
        println!("   Messages: {}", stats.message_count);
        println!("   Unread messages: {}", stats.unread_count);
        println!("   Conversations: {}", state.conversations.len());
        match state.last_synced_at {
            Some(at) => println!("   Last sync: {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")),
            None => println!("   Last sync: never"),
        }
        Ok(())
    }

    async fn handle_send(&self, args: SendArgs) -> Result<()> {
        let draft = match &args.reply_to {
            Some(message_id) => {
                let original = self
                    .store
                    .fetch_message(message_id, self.account_key())
                    .await?
                    .ok_or_else(|| anyhow!("Message {} is not cached", message_id))?;
                Draft::reply_to(&original, args.body)
            }
            None => {
                if args.to.is_empty() {
                    return Err(anyhow!("At least one --to recipient is required"));
                }
                Draft::new(args.to, args.subject, args.body)
            }
        };

        self.service.send(&draft).await?;
        println!("Sent '{}' to {}", draft.subject, draft.to.join(", "));
        Ok(())
    }

    async fn handle_attachment(&self, args: AttachmentArgs) -> Result<()> {
        match args.command {
            AttachmentCommands::Import { attachment_id, file } => {
                let data = tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("Cannot read {}", file.display()))?;
                self.store.save_attachment_data(&attachment_id, &data).await?;
                println!("Stored {} bytes for attachment {}", data.len(), attachment_id);
            }
            AttachmentCommands::Export { attachment_id, output } => {
                let data = self
                    .store
                    .get_attachment_data(&attachment_id)
                    .await?
                    .ok_or_else(|| anyhow!("No payload cached for attachment {}", attachment_id))?;
                tokio::fs::write(&output, &data)
                    .await
                    .with_context(|| format!("Cannot write {}", output.display()))?;
                println!("Wrote {} bytes to {}", data.len(), output.display());
            }
        }
        Ok(())
    }
}

fn report_state(state: &SyncState, last_error: &mut Option<String>) {
    if let Some(progress) = &state.progress {
        println!("{}", progress);
    }

    if state.error != *last_error {
        if let Some(error) = &state.error {
            eprintln!("Sync error: {}", error);
        }
        *last_error = state.error.clone();
    }

    if !state.is_loading && state.progress.is_none() {
        if let Some(at) = state.last_synced_at {
            debug!(
                "{} conversations, last sync {}",
                state.conversations.len(),
                at.with_timezone(&Local).format("%H:%M:%S")
            );
        }
    }
}

fn print_conversation(conversation: &Conversation) {
    let unread = conversation.unread_count();
    let marker = if unread > 0 { "*" } else { " " };
    let latest = conversation
        .latest_received_at()
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let preview = conversation
        .latest_message()
        .map(|m| m.preview.as_str())
        .unwrap_or("");

    println!(
        "{} {:<36} {:>3} msgs  {}  {}",
        marker,
        conversation.label,
        conversation.message_count(),
        latest,
        preview
    );
    if conversation.label != conversation.id {
        println!("    id: {}", conversation.id);
    }
}

fn print_thread(thread: &Thread) {
    let latest = thread
        .latest_received_at()
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let unread = thread.unread_count();
    println!(
        "{} {:<24} {:<40} {:>3} msgs  {}",
        if unread > 0 { "*" } else { " " },
        thread.id,
        thread.subject,
        thread.messages.len(),
        latest
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_overrides() {
        let cli = Cli::try_parse_from(["conversa", "sync", "--once", "--mode", "batch", "--interval", "60"]).unwrap();
        let command = cli.command.unwrap();

        let options = command.sync_options(&AppConfig::default()).unwrap();
        assert_eq!(options.fetch_mode, FetchMode::Batch);
        assert_eq!(options.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cli = Cli::try_parse_from(["conversa", "sync", "--interval", "0"]).unwrap();
        assert!(cli.command.unwrap().sync_options(&AppConfig::default()).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["conversa", "stats", "--debug", "-a", "me@x.com"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.account.as_deref(), Some("me@x.com"));
        assert!(matches!(cli.command, Some(Commands::Stats)));
    }

    #[test]
    fn test_reply_conflicts_with_subject() {
        let parsed = Cli::try_parse_from([
            "conversa", "send", "--reply-to", "m1", "--subject", "x", "--body", "hi",
        ]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from(["conversa", "send", "--reply-to", "m1", "--body", "hi"]).unwrap();
        match cli.command {
            Some(Commands::Send(args)) => assert_eq!(args.reply_to.as_deref(), Some("m1")),
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_commands_subcommand_name() {
        let cli = Cli::try_parse_from(["conversa", "commands", "pin"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Palette { query: Some(_) })));
    }
}
