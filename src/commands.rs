//! Command palette registry: user-invokable actions keyed by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Grouping used when listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    Mail,
    Conversations,
    Sync,
    Account,
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCategory::Mail => write!(f, "Mail"),
            CommandCategory::Conversations => write!(f, "Conversations"),
            CommandCategory::Sync => write!(f, "Sync"),
            CommandCategory::Account => write!(f, "Account"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub title: String,
    pub category: CommandCategory,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub shortcut: Option<String>,
}

impl Command {
    pub fn new(id: impl Into<String>, title: impl Into<String>, category: CommandCategory) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category,
            keywords: Vec::new(),
            shortcut: None,
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_shortcut(mut self, shortcut: impl Into<String>) -> Self {
        self.shortcut = Some(shortcut.into());
        self
    }

    /// `needle` must already be lowercase
    fn matches(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self.id.to_lowercase().contains(needle)
            || self.keywords.iter().any(|k| k.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the mail client's built-in actions
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let defaults = [
            Command::new("mail.compose", "Compose Message", CommandCategory::Mail)
                .with_keywords(&["new", "write", "draft", "send"])
                .with_shortcut("c"),
            Command::new("mail.reply", "Reply", CommandCategory::Mail)
                .with_keywords(&["respond", "answer"])
                .with_shortcut("r"),
            Command::new("mail.mark_read", "Mark Conversation as Read", CommandCategory::Mail)
                .with_keywords(&["seen", "unread"]),
            Command::new("mail.archive", "Archive Message", CommandCategory::Mail)
                .with_keywords(&["done", "remove", "hide"])
                .with_shortcut("e"),
            Command::new("mail.search", "Search Mail", CommandCategory::Mail)
                .with_keywords(&["find", "filter", "subject"])
                .with_shortcut("/"),
            Command::new("conversation.pin", "Pin Conversation", CommandCategory::Conversations)
                .with_keywords(&["favorite", "top", "star"]),
            Command::new("conversation.unpin", "Unpin Conversation", CommandCategory::Conversations)
                .with_keywords(&["favorite", "top", "star"]),
            Command::new("conversation.promote", "Promote Thread to Topic", CommandCategory::Conversations)
                .with_keywords(&["topic", "split", "thread"]),
            Command::new("conversation.demote", "Merge Topic Back", CommandCategory::Conversations)
                .with_keywords(&["topic", "join", "thread"]),
            Command::new("sync.refresh", "Check for New Mail", CommandCategory::Sync)
                .with_keywords(&["fetch", "poll", "update"])
                .with_shortcut("Ctrl+R"),
            Command::new("sync.reload", "Reload Inbox", CommandCategory::Sync)
                .with_keywords(&["refetch", "full", "refresh"]),
            Command::new("sync.clear_cache", "Clear Local Cache", CommandCategory::Sync)
                .with_keywords(&["reset", "delete", "storage"]),
            Command::new("account.sign_in", "Sign In", CommandCategory::Account)
                .with_keywords(&["login", "authenticate", "gmail", "outlook"]),
            Command::new("account.switch", "Switch Account", CommandCategory::Account)
                .with_keywords(&["profile", "mailbox"]),
        ];

        for command in defaults {
            registry.register(command);
        }
        registry
    }

    /// Insert or replace the command with the same id. Returns the replaced one.
    pub fn register(&mut self, command: Command) -> Option<Command> {
        self.commands.insert(command.id.clone(), command)
    }

    pub fn unregister(&mut self, id: &str) -> Option<Command> {
        self.commands.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Command> {
        self.commands.get(id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Case-insensitive match on title, id or keywords, ordered by title.
    /// A blank query returns every command.
    pub fn search(&self, query: &str) -> Vec<&Command> {
        let needle = query.trim().to_lowercase();

        let mut results: Vec<&Command> = self
            .commands
            .values()
            .filter(|c| needle.is_empty() || c.matches(&needle))
            .collect();

        results.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        results
    }

    /// Commands grouped by category, each group ordered by title
    pub fn by_category(&self) -> Vec<(CommandCategory, Vec<&Command>)> {
        let mut groups: HashMap<CommandCategory, Vec<&Command>> = HashMap::new();
        for command in self.search("") {
            groups.entry(command.category).or_default().push(command);
        }

        let order = [
            CommandCategory::Mail,
            CommandCategory::Conversations,
            CommandCategory::Sync,
            CommandCategory::Account,
        ];
        order
            .into_iter()
            .filter_map(|category| groups.remove(&category).map(|cmds| (category, cmds)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let registry = CommandRegistry::with_defaults();
        assert!(!registry.is_empty());

        let compose = registry.get("mail.compose").unwrap();
        assert_eq!(compose.title, "Compose Message");
        assert_eq!(compose.shortcut.as_deref(), Some("c"));
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = CommandRegistry::new();
        assert!(registry.register(Command::new("x.one", "One", CommandCategory::Mail)).is_none());

        let replaced = registry.register(Command::new("x.one", "Uno", CommandCategory::Mail));
        assert_eq!(replaced.unwrap().title, "One");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("x.one").unwrap().title, "Uno");

        assert!(registry.unregister("x.one").is_some());
        assert!(registry.unregister("x.one").is_none());
        assert!(registry.get("x.one").is_none());
    }

    #[test]
    fn test_search_matches_title_id_and_keywords() {
        let registry = CommandRegistry::with_defaults();

        let by_title: Vec<_> = registry.search("ARCHIVE").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(by_title, vec!["mail.archive"]);

        let by_keyword: Vec<_> = registry.search("login").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(by_keyword, vec!["account.sign_in"]);

        let by_id: Vec<_> = registry.search("sync.").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(by_id.len(), 3);

        assert!(registry.search("no-such-thing").is_empty());
    }

    #[test]
    fn test_search_blank_returns_all_sorted() {
        let registry = CommandRegistry::with_defaults();
        let all = registry.search("   ");
        assert_eq!(all.len(), registry.len());

        let titles: Vec<_> = all.iter().map(|c| c.title.as_str()).collect();
        let mut sorted = titles.clone();
        sorted.sort();
        assert_eq!(titles, sorted);
    }

    #[test]
    fn test_by_category() {
        let registry = CommandRegistry::with_defaults();
        let groups = registry.by_category();
        assert_eq!(groups[0].0, CommandCategory::Mail);
        let total: usize = groups.iter().map(|(_, cmds)| cmds.len()).sum();
        assert_eq!(total, registry.len());
    }
}
