pub mod conversation;
pub mod database;
pub mod message;
pub mod synchronizer;

pub use conversation::{group_conversations, merge_thread, sort_conversations, Conversation, GroupingContext};
pub use database::{LocalStore, SqliteStore, StoreError, StoreResult, StoreStats};
pub use message::{AttachmentRef, Draft, Message, Thread};
pub use synchronizer::{
    ConversationSynchronizer, FetchMode, SyncError, SyncHandle, SyncOptions, SyncOutcome, SyncResult, SyncState, MIN_POLL_INTERVAL,
};
