//! End-to-end runs against an inbox export on disk and a SQLite file

use chrono::{TimeZone, Utc};
use conversa::cli::{CliHandler, Commands, SyncArgs};
use conversa::config::{AccountConfig, AppConfig};
use conversa::email::{ConversationSynchronizer, FetchMode, Message, SqliteStore, SyncOptions, Thread};
use conversa::provider::{Account, JsonMailService, MailService, Provider};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const ME: &str = "me@x.com";

fn thread(id: &str, from: &str, to: &[&str], secs: i64) -> Thread {
    let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
    let subject = format!("Subject {}", id);
    Thread::new(
        id,
        subject.clone(),
        vec![Message::new(
            format!("{}-m1", id),
            id,
            subject,
            from,
            to.iter().map(|s| s.to_string()).collect(),
            at,
        )
        .with_body("Hello\nthere")],
    )
}

fn write_jsonl(path: &Path, threads: &[Thread]) {
    let content: Vec<String> = threads
        .iter()
        .map(|t| serde_json::to_string(t).unwrap())
        .collect();
    std::fs::write(path, content.join("\n")).unwrap();
}

#[tokio::test]
async fn test_sync_survives_restart() {
    let dir = tempdir().unwrap();
    let inbox = dir.path().join("inbox.jsonl");
    let db_path = dir.path().join("mail.db");
    write_jsonl(
        &inbox,
        &[
            thread("t1", "alice@x.com", &[ME], 10),
            thread("t2", ME, &[ME, "bob@x.com"], 20),
        ],
    );

    let account = Account::new(ME, Provider::Local);
    {
        let service = Arc::new(JsonMailService::new(account.clone(), &inbox));
        service.authenticate().await.unwrap();
        let store = Arc::new(SqliteStore::new(db_path.to_str().unwrap()).await.unwrap());
        let sync = ConversationSynchronizer::new(account.clone(), service, store, SyncOptions::default());

        sync.refresh().await.unwrap();
        let ids: Vec<_> = sync.conversations().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["bob@x.com".to_string(), "alice@x.com".to_string()]);
        sync.mark_conversation_read("alice@x.com").await.unwrap();
    }

    // The inbox export goes away; the cache still serves the conversations
    std::fs::remove_file(&inbox).unwrap();

    let service = Arc::new(JsonMailService::new(account.clone(), &inbox));
    service.restore_account(&account).await.unwrap();
    let store = Arc::new(SqliteStore::new(db_path.to_str().unwrap()).await.unwrap());
    let sync = ConversationSynchronizer::new(
        account,
        service,
        store,
        SyncOptions {
            fetch_mode: FetchMode::Batch,
            ..SyncOptions::default()
        },
    );

    assert_eq!(sync.load_cached().await.unwrap(), 2);
    let before = sync.conversations();
    let alice = before.iter().find(|c| c.id == "alice@x.com").unwrap();
    assert_eq!(alice.unread_count(), 0);
    assert_eq!(alice.messages[0].preview, "Hello");

    // Fetching now fails, and the cached list stays
    assert!(sync.refresh().await.is_err());
    assert!(Arc::ptr_eq(&before, &sync.conversations()));
    assert!(sync.snapshot().error.is_some());
}

#[tokio::test]
async fn test_cli_handler_runs_one_pass() {
    let dir = tempdir().unwrap();
    let inbox = dir.path().join("inbox.json");
    std::fs::write(
        &inbox,
        serde_json::to_string(&vec![thread("t1", "alice@x.com", &[ME], 10)]).unwrap(),
    )
    .unwrap();

    let config = AppConfig {
        database_path: Some(dir.path().join("data").join("mail.db")),
        accounts: vec![AccountConfig {
            email: ME.to_string(),
            provider: Provider::Local,
            display_name: Some("Me".to_string()),
            inbox_path: inbox,
            outbox_path: Some(dir.path().join("outbox.jsonl")),
        }],
        ..AppConfig::default()
    };

    let command = Commands::Sync(SyncArgs {
        once: true,
        reload: false,
        mode: None,
        interval: None,
    });
    let options = command.sync_options(&config).unwrap();
    let handler = CliHandler::new(&config, None, options).await.unwrap();
    handler.handle_command(command).await.unwrap();

    let sync = handler.synchronizer();
    assert_eq!(sync.conversations().len(), 1);
    assert!(sync.snapshot().last_synced_at.is_some());
    assert!(dir.path().join("data").join("mail.db").exists());

    handler
        .handle_command(Commands::Pin {
            conversation_id: "alice@x.com".to_string(),
        })
        .await
        .unwrap();
    handler.handle_command(Commands::Stats).await.unwrap();
}
