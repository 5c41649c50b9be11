//! End-to-end tests for command handling and chat sessions.
//!
//! The platform and the completion backend are replaced by recording fakes;
//! the user store runs against a temporary directory.

use async_trait::async_trait;
use relay_bot::collector::{timeout_notice, EndReason, EXIT_ACK};
use relay_bot::dispatch::QUEUE_FULL;
use relay_bot::relay::{NO_KEY, NO_PROMPT};
use relay_bot::{
    Channel, ChannelMessage, ChannelResult, CompletionClient, Dispatcher, InboundEvent,
    Interaction, MessageRef, OutgoingMessage, Relay, Reply, UserStore,
};
use relay_common::config::SessionConfig;
use relay_common::security::{Credential, EncryptionKey, SecretCodec};
use relay_common::Error;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingChannel {
    responses: Mutex<Vec<(String, Reply)>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    withdrawn: Mutex<Vec<MessageRef>>,
}

impl RecordingChannel {
    fn last_response(&self) -> Reply {
        self.responses.lock().unwrap().last().unwrap().1.clone()
    }

    fn response_count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn respond(&self, interaction: &Interaction, reply: Reply) -> ChannelResult<MessageRef> {
        self.responses
            .lock()
            .unwrap()
            .push((interaction.user_id.clone(), reply));
        Ok(MessageRef::Interaction {
            token: interaction.token.clone(),
        })
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<MessageRef> {
        let channel_id = message.channel_id.clone();
        self.sent.lock().unwrap().push(message);
        Ok(MessageRef::Channel {
            channel_id,
            message_id: "sent".into(),
        })
    }

    async fn withdraw(&self, message: &MessageRef) -> ChannelResult<()> {
        self.withdrawn.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Completion stub returning scripted replies and recording every exchange.
#[derive(Default)]
struct ScriptedCompletion {
    replies: Mutex<VecDeque<relay_common::Result<String>>>,
    exchanges: Mutex<Vec<(String, String, String)>>,
    hang_for: Option<String>,
}

impl ScriptedCompletion {
    fn with_replies(replies: Vec<relay_common::Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Never answer requests made with this key.
    fn hanging_for(key: &str) -> Self {
        Self {
            hang_for: Some(key.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(
        &self,
        system_instruction: &str,
        user_message: &str,
        credential: &Credential,
    ) -> relay_common::Result<String> {
        self.exchanges.lock().unwrap().push((
            system_instruction.to_string(),
            user_message.to_string(),
            credential.expose().to_string(),
        ));
        if self.hang_for.as_deref() == Some(credential.expose()) {
            std::future::pending::<()>().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".into()))
    }
}

struct Harness {
    relay: Arc<Relay>,
    channel: Arc<RecordingChannel>,
    completion: Arc<ScriptedCompletion>,
    dir: TempDir,
}

fn codec() -> SecretCodec {
    SecretCodec::new(EncryptionKey::from_bytes([42u8; 32]))
}

async fn harness_with(completion: ScriptedCompletion) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(UserStore::load(dir.path().join("users.json"), codec()).await);
    harness_on(dir, store, completion)
}

fn harness_on(dir: TempDir, store: Arc<UserStore>, completion: ScriptedCompletion) -> Harness {
    let channel = Arc::new(RecordingChannel::default());
    let completion = Arc::new(completion);
    let relay = Arc::new(Relay::new(
        store,
        channel.clone(),
        completion.clone(),
        SessionConfig::default(),
    ));
    Harness {
        relay,
        channel,
        completion,
        dir,
    }
}

async fn harness() -> Harness {
    harness_with(ScriptedCompletion::default()).await
}

fn command(user: &str, name: &str, options: &[(&str, &str)]) -> Interaction {
    Interaction {
        id: format!("{user}-{name}"),
        token: format!("token-{user}-{name}"),
        channel_id: "c1".into(),
        user_id: user.into(),
        user_name: format!("{user}-name"),
        command: name.into(),
        options: options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    }
}

fn message(user: &str, text: &str) -> ChannelMessage {
    ChannelMessage {
        id: format!("{user}-{text}"),
        channel_id: "c1".into(),
        user_id: user.into(),
        text: text.into(),
        timestamp: 0,
    }
}

async fn prepare_user(h: &Harness, user: &str) {
    h.relay
        .handle(&command(user, "setprompt", &[("prompt", "be terse")]))
        .await;
    h.relay
        .handle(&command(user, "setkey", &[("key", "sk-abc")]))
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_setkey_then_info_reports_key_only() {
    let h = harness().await;

    h.relay
        .handle(&command("U1", "setkey", &[("key", "sk-abc")]))
        .await;
    h.relay.handle(&command("U1", "info", &[])).await;

    let info = h.channel.last_response();
    assert!(info.ephemeral);
    assert!(info.text.contains("API key: saved"));
    assert!(info.text.contains("Custom prompt: not saved"));
    assert!(info.text.contains("Chat session: none"));

    let on_disk = std::fs::read_to_string(h.dir.path().join("users.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
    let token = json["U1"]["openaiKey"].as_str().unwrap();
    assert!(!on_disk.contains("sk-abc"));
    assert_eq!(codec().decrypt(token).unwrap().as_str(), "sk-abc");
}

#[tokio::test]
async fn test_every_reply_is_private() {
    let h = harness().await;
    prepare_user(&h, "U1").await;
    for name in ["promptlimit", "info", "help", "deleteprompt", "deletekey", "nope"] {
        h.relay.handle(&command("U1", name, &[])).await;
    }

    let responses = h.channel.responses.lock().unwrap();
    assert_eq!(responses.len(), 8);
    assert!(responses.iter().all(|(_, reply)| reply.ephemeral));
}

#[tokio::test]
async fn test_oversized_prompt_keeps_previous() {
    let h = harness().await;
    let previous = "a".repeat(4000);
    h.relay
        .handle(&command("U1", "setprompt", &[("prompt", previous.as_str())]))
        .await;
    assert!(h.channel.last_response().text.contains("saved"));

    let oversized = "b".repeat(4001);
    h.relay
        .handle(&command("U1", "setprompt", &[("prompt", oversized.as_str())]))
        .await;
    assert!(h.channel.last_response().text.contains("4000"));

    let record = h.relay.store().get("U1").await;
    assert_eq!(record.custom_instruction.as_deref(), Some(previous.as_str()));
}

#[tokio::test]
async fn test_delete_twice_reports_nothing_to_delete() {
    let h = harness().await;
    prepare_user(&h, "U1").await;

    h.relay.handle(&command("U1", "deleteprompt", &[])).await;
    assert_eq!(h.channel.last_response().text, "Your custom prompt has been deleted.");
    h.relay.handle(&command("U1", "deleteprompt", &[])).await;
    assert_eq!(h.channel.last_response().text, "You don't have a saved prompt to delete.");

    h.relay.handle(&command("U1", "deletekey", &[])).await;
    h.relay.handle(&command("U1", "deletekey", &[])).await;
    assert_eq!(h.channel.last_response().text, "You don't have a saved API key to delete.");

    let record = h.relay.store().get("U1").await;
    assert!(!record.has_instruction());
    assert!(!record.has_credential());
}

#[tokio::test]
async fn test_settings_survive_restart() {
    let h = harness().await;
    prepare_user(&h, "U1").await;
    let path = h.relay.store().path().to_path_buf();

    let reloaded = UserStore::load(path, codec()).await;
    assert_eq!(
        reloaded.get("U1").await.custom_instruction.as_deref(),
        Some("be terse")
    );
    assert_eq!(
        reloaded.credential("U1").await.unwrap().unwrap().expose(),
        "sk-abc"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat sessions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_without_prompt_is_denied() {
    let h = harness().await;
    h.relay
        .handle(&command("U1", "setkey", &[("key", "sk-abc")]))
        .await;

    let session = h.relay.handle(&command("U1", "chat", &[])).await;

    assert!(session.is_none());
    assert_eq!(h.channel.last_response().text, NO_PROMPT);
    assert!(!h.relay.registry().is_active("U1"));
    assert_eq!(h.relay.hub().subscriber_count(), 0);
}

#[tokio::test]
async fn test_chat_without_key_is_denied() {
    let h = harness().await;
    h.relay
        .handle(&command("U1", "setprompt", &[("prompt", "be terse")]))
        .await;

    let session = h.relay.handle(&command("U1", "chat", &[])).await;

    assert!(session.is_none());
    assert_eq!(h.channel.last_response().text, NO_KEY);
    assert!(!h.relay.registry().is_active("U1"));
}

#[tokio::test]
async fn test_chat_relays_until_exit() {
    let h = harness_with(ScriptedCompletion::with_replies(vec![Ok("hi there".into())])).await;
    prepare_user(&h, "U1").await;

    let session = h
        .relay
        .handle(&command("U1", "chat", &[]))
        .await
        .expect("session should start");
    assert!(h.relay.registry().is_active("U1"));
    let announcement = h.channel.last_response();
    assert!(announcement.ephemeral);
    assert!(announcement.text.contains("be terse"));

    assert!(h.relay.hub().publish(message("U1", "hello")));
    assert!(h.relay.hub().publish(message("U1", "exit")));
    let summary = session.await.unwrap();

    assert_eq!(summary.reason, EndReason::Exit);
    assert_eq!(summary.messages_processed, 2);
    assert_eq!(h.channel.sent_texts(), vec!["hi there".to_string(), EXIT_ACK.to_string()]);
    assert_eq!(
        h.completion.exchanges.lock().unwrap().clone(),
        vec![("be terse".to_string(), "hello".to_string(), "sk-abc".to_string())]
    );
    assert!(!h.relay.registry().is_active("U1"));
    assert_eq!(h.relay.hub().subscriber_count(), 0);
    assert_eq!(
        h.channel.withdrawn.lock().unwrap().clone(),
        vec![MessageRef::Interaction {
            token: "token-U1-chat".into()
        }]
    );
}

#[tokio::test]
async fn test_other_users_messages_are_not_relayed() {
    let h = harness().await;
    prepare_user(&h, "U1").await;
    let session = h.relay.handle(&command("U1", "chat", &[])).await.unwrap();

    assert!(!h.relay.hub().publish(message("U2", "hello from someone else")));
    let mut elsewhere = message("U1", "other channel");
    elsewhere.channel_id = "c2".into();
    assert!(!h.relay.hub().publish(elsewhere));

    h.relay.hub().publish(message("U1", "stop"));
    let summary = session.await.unwrap();
    assert_eq!(summary.messages_processed, 1);
    assert!(h.completion.exchanges.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_inline_prompt_is_used_but_not_saved() {
    let h = harness().await;
    h.relay
        .handle(&command("U1", "setkey", &[("key", "sk-abc")]))
        .await;

    let session = h
        .relay
        .handle(&command("U1", "chat", &[("prompt", "talk like a pirate")]))
        .await
        .unwrap();
    h.relay.hub().publish(message("U1", "hello"));
    h.relay.hub().publish(message("U1", "exit"));
    session.await.unwrap();

    assert_eq!(h.completion.exchanges.lock().unwrap()[0].0, "talk like a pirate");
    assert!(!h.relay.store().get("U1").await.has_instruction());
}

#[tokio::test]
async fn test_oversized_inline_prompt_is_rejected() {
    let h = harness().await;
    h.relay
        .handle(&command("U1", "setkey", &[("key", "sk-abc")]))
        .await;

    let oversized = "x".repeat(4001);
    let session = h
        .relay
        .handle(&command("U1", "chat", &[("prompt", oversized.as_str())]))
        .await;

    assert!(session.is_none());
    assert!(!h.relay.registry().is_active("U1"));
}

#[tokio::test]
async fn test_backend_failures_keep_session_open() {
    let h = harness_with(ScriptedCompletion::with_replies(vec![
        Err(Error::BackendTransport("connection refused".into())),
        Err(Error::BackendParse("no choices".into())),
        Ok("fine now".into()),
    ]))
    .await;
    prepare_user(&h, "U1").await;

    let session = h.relay.handle(&command("U1", "chat", &[])).await.unwrap();
    for text in ["one", "two", "three", "exit"] {
        h.relay.hub().publish(message("U1", text));
    }
    let summary = session.await.unwrap();

    assert_eq!(summary.reason, EndReason::Exit);
    let texts = h.channel.sent_texts();
    assert_eq!(texts.len(), 4);
    assert!(texts[0].contains("error contacting OpenAI"));
    assert!(texts[1].contains("couldn't understand"));
    assert_eq!(texts[2], "fine now");
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_times_out_and_frees_user() {
    let h = harness().await;
    prepare_user(&h, "U1").await;

    let session = h.relay.handle(&command("U1", "chat", &[])).await.unwrap();
    let summary = session.await.unwrap();

    assert_eq!(summary.reason, EndReason::Timeout);
    assert_eq!(summary.messages_processed, 0);
    assert_eq!(h.channel.sent_texts(), vec![timeout_notice("U1-name")]);
    assert!(!h.relay.registry().is_active("U1"));
    assert_eq!(h.channel.withdrawn.lock().unwrap().len(), 1);

    let again = h.relay.handle(&command("U1", "chat", &[])).await;
    assert!(again.is_some());
    assert!(h.relay.registry().is_active("U1"));
}

#[tokio::test]
async fn test_second_chat_conflicts_with_open_session() {
    let h = harness().await;
    prepare_user(&h, "U2").await;

    let first = h.relay.handle(&command("U2", "chat", &[])).await.unwrap();
    let second = h.relay.handle(&command("U2", "chat", &[])).await;

    assert!(second.is_none());
    assert!(h
        .channel
        .last_response()
        .text
        .contains("already have an active chat session"));
    assert!(h.relay.registry().is_active("U2"));

    // The original session still receives and answers messages.
    assert!(h.relay.hub().publish(message("U2", "still here?")));
    h.relay.hub().publish(message("U2", "exit"));
    let summary = first.await.unwrap();
    assert_eq!(summary.messages_processed, 2);
    assert_eq!(h.channel.sent_texts()[0], "ok");
}

#[tokio::test]
async fn test_concurrent_chats_admit_one() {
    let h = harness().await;
    prepare_user(&h, "U1").await;

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let relay = Arc::clone(&h.relay);
            tokio::spawn(async move { relay.handle(&command("U1", "chat", &[])).await })
        })
        .collect();

    let mut sessions = Vec::new();
    for attempt in attempts {
        if let Some(session) = attempt.await.unwrap() {
            sessions.push(session);
        }
    }
    assert_eq!(sessions.len(), 1);

    h.relay.hub().publish(message("U1", "exit"));
    sessions.pop().unwrap().await.unwrap();
    assert!(!h.relay.registry().is_active("U1"));
}

#[tokio::test]
async fn test_undecryptable_key_blocks_chat() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("users.json");
    std::fs::write(
        &path,
        r#"{"U1": {"promptId": "be terse", "openaiKey": "00112233445566778899aabbccddeeff:deadbeef"}}"#,
    )
    .unwrap();
    let store = Arc::new(UserStore::load(path, codec()).await);
    let h = harness_on(dir, store, ScriptedCompletion::default());

    let session = h.relay.handle(&command("U1", "chat", &[])).await;

    assert!(session.is_none());
    assert!(h.channel.last_response().text.contains("/setkey"));
    assert!(!h.relay.registry().is_active("U1"));
}

#[tokio::test]
async fn test_hung_backend_does_not_block_other_users() {
    let h = harness_with(ScriptedCompletion::hanging_for("sk-slow")).await;
    h.relay
        .handle(&command("U1", "setprompt", &[("prompt", "be terse")]))
        .await;
    h.relay
        .handle(&command("U1", "setkey", &[("key", "sk-slow")]))
        .await;

    let stuck = h.relay.handle(&command("U1", "chat", &[])).await.unwrap();
    h.relay.hub().publish(message("U1", "hello"));
    tokio::task::yield_now().await;

    prepare_user(&h, "U2").await;
    let other = h.relay.handle(&command("U2", "chat", &[])).await.unwrap();
    h.relay.hub().publish(message("U2", "hi"));
    h.relay.hub().publish(message("U2", "exit"));
    let summary = tokio::time::timeout(Duration::from_secs(5), other)
        .await
        .expect("other user's session should finish")
        .unwrap();

    assert_eq!(summary.reason, EndReason::Exit);
    assert!(h.relay.registry().is_active("U1"));
    stuck.abort();
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

async fn wait_for_responses(channel: &RecordingChannel, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.response_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("commands should be answered");
}

#[tokio::test]
async fn test_same_user_commands_apply_in_order() {
    let h = harness().await;
    let dispatcher = Dispatcher::new(Arc::clone(&h.relay), 32);

    for i in 0..10 {
        let prompt = format!("prompt {i}");
        dispatcher.dispatch(InboundEvent::Command(command(
            "U1",
            "setprompt",
            &[("prompt", prompt.as_str())],
        )));
    }
    dispatcher.dispatch(InboundEvent::Command(command("U1", "deletekey", &[])));
    wait_for_responses(&h.channel, 11).await;

    assert_eq!(
        h.relay.store().get("U1").await.custom_instruction.as_deref(),
        Some("prompt 9")
    );
    assert_eq!(dispatcher.worker_count(), 1);
}

#[tokio::test]
async fn test_full_queue_answers_rejected_commands() {
    let h = harness().await;
    let dispatcher = Dispatcher::new(Arc::clone(&h.relay), 1);

    // The worker has not run yet, so its single slot stays taken.
    for i in 0..3 {
        let prompt = format!("prompt {i}");
        dispatcher.dispatch(InboundEvent::Command(command(
            "U1",
            "setprompt",
            &[("prompt", prompt.as_str())],
        )));
    }
    wait_for_responses(&h.channel, 3).await;

    let responses = h.channel.responses.lock().unwrap().clone();
    let rejected: Vec<_> = responses
        .iter()
        .filter(|(_, reply)| reply.text == QUEUE_FULL)
        .collect();
    assert_eq!(rejected.len(), 2);
    assert!(responses.iter().all(|(user, reply)| user == "U1" && reply.ephemeral));
    assert_eq!(
        h.relay.store().get("U1").await.custom_instruction.as_deref(),
        Some("prompt 0")
    );
}

#[tokio::test]
async fn test_dispatcher_routes_messages_to_sessions() {
    let h = harness_with(ScriptedCompletion::with_replies(vec![Ok("routed".into())])).await;
    prepare_user(&h, "U1").await;
    let dispatcher = Dispatcher::new(Arc::clone(&h.relay), 32);
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = Arc::clone(&dispatcher).spawn(rx);

    tx.send(InboundEvent::Command(command("U1", "chat", &[])))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.relay.registry().is_active("U1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tx.send(InboundEvent::Message(message("U1", "hello")))
        .await
        .unwrap();
    tx.send(InboundEvent::Message(message("U1", "exit")))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.relay.registry().is_active("U1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.channel.sent_texts(), vec!["routed".to_string(), EXIT_ACK.to_string()]);
    drop(tx);
    handle.await.unwrap();
}
