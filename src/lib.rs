pub mod cli;
pub mod commands;
pub mod config;
pub mod email;
pub mod provider;

pub use commands::{Command, CommandRegistry};
pub use config::AppConfig;
pub use email::{ConversationSynchronizer, SyncHandle};
