use super::{open_session, test_runtime};
use panelchat_core::storage::keys;
use panelchat_core::{
    ChatRequest, FileStore, KeyValueStore, MemoryStore, MockRemote, SendError, Turn,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const GREETING: &str = "Hi! How can I help?";

#[test]
fn identity_is_stable_across_restarts() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");

    let first = runtime.block_on(async {
        let storage = Arc::new(FileStore::open(temp_dir.path()).await.expect("open"));
        let session = open_session(storage, Arc::new(MockRemote::new())).await;
        let a = session.identity.get_or_create().await.expect("identity");
        let b = session.identity.get_or_create().await.expect("identity");
        assert_eq!(a, b);
        a
    });

    let second = runtime.block_on(async {
        let storage = Arc::new(FileStore::open(temp_dir.path()).await.expect("reopen"));
        let session = open_session(storage, Arc::new(MockRemote::new())).await;
        session.identity.get_or_create().await.expect("identity")
    });
    assert_eq!(first, second);
}

#[test]
fn empty_storage_is_seeded_with_greeting() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let session = open_session(Arc::new(MemoryStore::new()), Arc::new(MockRemote::new())).await;
        assert!(!session.restored);
        assert!(session.client.store().is_empty());

        session.client.store().seed_greeting(GREETING).await;
        assert_eq!(session.client.store().history(), vec![Turn::assistant(GREETING)]);
    });
}

#[test]
fn first_question_scenario() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let remote = Arc::new(MockRemote::new());
        remote.push_reply("Several...", "abc");
        let session = open_session(Arc::new(MemoryStore::new()), remote.clone()).await;

        let reply = session
            .client
            .send("What jobs are open?")
            .await
            .expect("reply");
        assert_eq!(reply, "Several...");
        assert_eq!(
            remote.chat_requests(),
            vec![ChatRequest {
                message: "What jobs are open?".to_string(),
                history: Vec::new(),
                session_id: None,
            }]
        );
        assert_eq!(
            session.client.store().history(),
            vec![Turn::user("What jobs are open?"), Turn::assistant("Several...")]
        );
        assert_eq!(session.client.store().session_id().as_deref(), Some("abc"));
    });
}

#[test]
fn history_matches_every_exchange_in_order() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let remote = Arc::new(MockRemote::new());
        let session = open_session(Arc::new(MemoryStore::new()), remote.clone()).await;
        let replies = ["*first*", "| a | b |\n|---|---|", "`code`", "plain"];
        for (i, reply) in replies.iter().enumerate() {
            remote.push_reply(*reply, "s");
            session
                .client
                .send(&format!("question {i}"))
                .await
                .expect("exchange");
        }

        let history = session.client.store().history();
        assert_eq!(history.len(), 2 * replies.len());
        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(history[2 * i], Turn::user(format!("question {i}")));
            assert_eq!(history[2 * i + 1], Turn::assistant(*reply));
        }
        // Each request carried exactly the turns before it.
        for (i, request) in remote.chat_requests().iter().enumerate() {
            assert_eq!(request.history, history[..2 * i].to_vec());
        }
    });
}

#[test]
fn failed_exchange_leaves_no_orphan() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let remote = Arc::new(MockRemote::new());
        let session = open_session(Arc::new(MemoryStore::new()), remote.clone()).await;

        remote.push_chat(Err(MockRemote::transport_failure("/chat")));
        let err = session.client.send("hello").await.expect_err("failure");
        assert!(matches!(err, SendError::Protocol(_)));
        assert_eq!(session.client.store().history(), vec![Turn::user("hello")]);
        assert!(!session.client.is_pending());

        remote.push_reply("hi there", "s1");
        session.client.send("world").await.expect("retry by hand");
        let requests = remote.chat_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].history, vec![Turn::user("hello")]);
    });
}

#[test]
fn session_id_follows_latest_response() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let remote = Arc::new(MockRemote::new());
        let session = open_session(Arc::new(MemoryStore::new()), remote.clone()).await;
        remote.push_reply("one", "s1");
        remote.push_reply("two", "s2");
        remote.push_reply("three", "s2");

        session.client.send("a").await.unwrap();
        session.client.send("b").await.unwrap();
        assert_eq!(session.client.store().session_id().as_deref(), Some("s2"));
        session.client.send("c").await.unwrap();

        let requests = remote.chat_requests();
        assert_eq!(requests[2].session_id.as_deref(), Some("s2"));
    });
}

#[test]
fn transcript_and_session_survive_restart() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");

    runtime.block_on(async {
        let storage = Arc::new(FileStore::open(temp_dir.path()).await.expect("open"));
        let remote = Arc::new(MockRemote::new());
        remote.push_reply("**Several** roles", "abc");
        let session = open_session(storage, remote).await;
        session.client.store().seed_greeting(GREETING).await;
        session.client.send("What jobs are open?").await.unwrap();
    });

    runtime.block_on(async {
        let storage = Arc::new(FileStore::open(temp_dir.path()).await.expect("reopen"));
        assert_eq!(
            storage.get(keys::CONVERSATION_HISTORY).await.unwrap(),
            Some(json!([
                {"text": GREETING, "isUserTurn": false, "isMarkup": true},
                {"text": "What jobs are open?", "isUserTurn": true, "isMarkup": false},
                {"text": "**Several** roles", "isUserTurn": false, "isMarkup": true},
            ]))
        );

        let remote = Arc::new(MockRemote::new());
        let session = open_session(storage, remote.clone()).await;
        assert!(session.restored);
        assert!(!session.client.store().seed_greeting(GREETING).await);

        session.client.send("Any remote ones?").await.unwrap();
        let request = &remote.chat_requests()[0];
        assert_eq!(request.session_id.as_deref(), Some("abc"));
        assert_eq!(request.history.len(), 3);
        assert_eq!(request.history[2], Turn::assistant("**Several** roles"));
    });
}

#[test]
fn storage_outage_does_not_break_the_exchange() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let storage = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let session = open_session(storage.clone(), remote.clone()).await;
        session.identity.get_or_create().await.expect("identity");

        storage.fail_writes(true);
        remote.push_reply("still here", "s1");
        let reply = session.client.send("are you there?").await.expect("reply");
        assert_eq!(reply, "still here");
        assert!(session.client.store().is_dirty());
        assert_eq!(session.client.store().len(), 2);

        storage.fail_writes(false);
        session.client.send("good").await.expect("reply");
        assert!(!session.client.store().is_dirty());
        let stored = storage.peek(keys::CONVERSATION_HISTORY).expect("history");
        assert_eq!(stored.as_array().map(Vec::len), Some(4));
    });
}
