use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use whatsapp_console::test_utils::{MockHttpClient, MockReply, MockStreamFactory};
use whatsapp_console::types::events::Event;
use whatsapp_console::types::{Direction, LocalId, MessageStatus};
use whatsapp_console::{ChatConsole, ClientConfig, ConsoleError, InstanceCredentials};

const CHAT: &str = "5511999999999@s.whatsapp.net";

struct Harness {
    console: ChatConsole,
    http: Arc<MockHttpClient>,
    factory: Arc<MockStreamFactory>,
    events: broadcast::Receiver<Event>,
}

async fn connected(config: ClientConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let http = Arc::new(MockHttpClient::new());
    let factory = Arc::new(MockStreamFactory::new());
    let console = ChatConsole::new(config, http.clone(), factory.clone());
    let events = console.subscribe();

    console
        .select_instance(InstanceCredentials::new("main", "secret"))
        .await;
    factory.wait_for_sessions(1).await;
    Harness {
        console,
        http,
        factory,
        events,
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<Event>, mut predicate: impl FnMut(&Event) -> bool) -> Event {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_status(rx: &mut broadcast::Receiver<Event>, id: LocalId, wanted: MessageStatus) {
    wait_for(rx, |event| {
        matches!(event, Event::MessageStatusChanged { local_id, status, .. } if *local_id == id && *status == wanted)
    })
    .await;
}

fn inbound(server_id: &str, text: &str, timestamp: i64) -> Value {
    json!({
        "type": "messages",
        "data": {
            "chatid": CHAT,
            "messageid": server_id,
            "fromMe": false,
            "sender": CHAT,
            "senderName": "Ana",
            "text": text,
            "messageTimestamp": timestamp
        }
    })
}

fn status_frame(server_id: &str, status: &str) -> Value {
    json!({"type": "messages_update", "data": {"messageid": server_id, "status": status}})
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_send_reconciles_and_follows_status() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.http.respond_json_after(
        "/message/sendText",
        Duration::from_millis(200),
        200,
        json!({"key": {"id": "S9"}, "messageTimestamp": 1700000000}),
    );

    let local_id = h.console.send_text(CHAT, "Hi").await.unwrap();

    let messages = h.console.messages(CHAT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].local_id, local_id);
    assert_eq!(messages[0].status, MessageStatus::Sending);
    assert_eq!(messages[0].direction, Direction::Outbound);
    assert!(messages[0].server_id.is_none());

    // Arrives before the send call returns and must be held until then.
    h.factory.push_frame(status_frame("S9", "delivered")).await;
    wait_for(&mut h.events, |e| matches!(e, Event::Gateway(_))).await;
    assert_eq!(h.console.message(local_id).unwrap().status, MessageStatus::Sending);

    wait_for_status(&mut h.events, local_id, MessageStatus::Delivered).await;
    let message = h.console.message(local_id).unwrap();
    assert_eq!(message.server_id.as_deref(), Some("S9"));

    h.factory.push_frame(status_frame("S9", "read")).await;
    wait_for_status(&mut h.events, local_id, MessageStatus::Read).await;

    // Late, stale acknowledgements never move the status back.
    h.factory.push_frame(status_frame("S9", "sent")).await;
    wait_for(&mut h.events, |e| matches!(e, Event::Gateway(_))).await;

    let messages = h.console.messages(CHAT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].local_id, local_id);
    assert_eq!(messages[0].status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn test_stream_echo_before_send_result_is_folded_in() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.http.respond_json_after(
        "/message/sendText",
        Duration::from_millis(200),
        200,
        json!({"key": {"id": "S9"}, "messageTimestamp": 1700000000}),
    );

    let local_id = h.console.send_text(CHAT, "Hi").await.unwrap();
    h.factory
        .push_frame(json!({
            "type": "messages",
            "data": {"chatid": CHAT, "messageid": "S9", "fromMe": true, "text": "Hi", "messageTimestamp": 1700000000}
        }))
        .await;

    wait_for(&mut h.events, |e| matches!(e, Event::MessagesChanged { .. })).await;
    let messages = h.console.messages(CHAT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].local_id, local_id);
    assert_eq!(messages[0].server_id.as_deref(), Some("S9"));
    assert!(matches!(
        messages[0].status,
        MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
    ));

    // A second redelivery after reconciliation is a no-op.
    h.factory
        .push_frame(json!({
            "type": "messages",
            "data": {"chatid": CHAT, "messageid": "S9", "fromMe": true, "text": "Hi", "messageTimestamp": 1700000000}
        }))
        .await;
    wait_for(&mut h.events, |e| matches!(e, Event::Gateway(_))).await;
    assert_eq!(h.console.messages(CHAT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_fails_and_retry_keeps_local_id() {
    let mut config = ClientConfig::new("http://gw");
    config.send_timeout = Duration::from_secs(5);
    let mut h = connected(config).await;
    h.http.push("/message/sendText", MockReply::Hang);
    h.http.respond_json(
        "/message/sendText",
        200,
        json!({"key": {"id": "S10"}, "messageTimestamp": 1700000000}),
    );

    let local_id = h.console.send_text(CHAT, "Hi").await.unwrap();
    let failed = wait_for(&mut h.events, |e| matches!(e, Event::MessageFailed { .. })).await;
    let Event::MessageFailed { local_id: failed_id, .. } = failed else {
        unreachable!()
    };
    assert_eq!(failed_id, local_id);
    assert_eq!(h.console.message(local_id).unwrap().status, MessageStatus::Failed);

    h.console.retry_failed(local_id).await.unwrap();
    wait_for_status(&mut h.events, local_id, MessageStatus::Sent).await;

    let messages = h.console.messages(CHAT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].local_id, local_id);
    assert_eq!(messages[0].server_id.as_deref(), Some("S10"));
    assert_eq!(h.http.calls("/message/sendText"), 2);

    // Only failed messages can be retried.
    assert!(h.console.retry_failed(local_id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_gateway_rejection_marks_message_failed() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.http
        .respond_json("/message/sendText", 500, json!({"error": "instance offline"}));

    let local_id = h.console.send_text(CHAT, "Hi").await.unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::MessageFailed { .. })).await;

    let message = h.console.message(local_id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert!(message.server_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_never_undoes_stream_state() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    let snapshot = json!([{
        "id": CHAT,
        "name": "Ana",
        "lastMessagePreview": "old",
        "lastMessageTimestamp": 1700000000,
        "unreadCount": 2
    }]);
    h.http.respond_json("/chat/find", 200, snapshot.clone());

    assert_eq!(h.console.load_snapshot().await.unwrap(), 1);
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 2);

    h.factory.push_frame(inbound("S1", "new", 1700000100)).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;

    let chat = h.console.chat(CHAT).unwrap();
    assert_eq!(chat.unread_count, 3);
    assert_eq!(chat.last_message_preview.as_deref(), Some("new"));

    // The same stale snapshot again.
    h.console.load_snapshot().await.unwrap();
    let chat = h.console.chat(CHAT).unwrap();
    assert_eq!(chat.unread_count, 3);
    assert_eq!(chat.last_message_preview.as_deref(), Some("new"));
    assert_eq!(chat.display_name.as_deref(), Some("Ana"));
    assert_eq!(h.console.messages(CHAT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_chat_loads_history_and_marks_read() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.factory.push_frame(inbound("S2", "second", 1700000100)).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 1);

    h.http.respond_json(
        "/message/find",
        200,
        json!({"messages": [
            {"chatid": CHAT, "messageid": "S1", "fromMe": false, "text": "first", "messageTimestamp": 1700000000},
            {"chatid": CHAT, "messageid": "S2", "fromMe": false, "text": "second", "messageTimestamp": 1700000100}
        ]}),
    );
    h.http.respond_json("/chat/read", 200, json!({}));

    assert_eq!(h.console.open_chat(CHAT).await.unwrap(), 1);

    let texts: Vec<String> = h
        .console
        .messages(CHAT)
        .iter()
        .map(|m| m.content.preview_text())
        .collect();
    assert_eq!(texts, ["first", "second"]);
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 0);
    assert_eq!(h.http.calls("/chat/read"), 1);

    // Messages for the open chat do not count as unread.
    h.factory.push_frame(inbound("S3", "third", 1700000200)).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 0);

    h.console.close_chat();
    h.factory.push_frame(inbound("S4", "fourth", 1700000300)).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_mark_read_survives_gateway_failure() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.factory.push_frame(inbound("S1", "hi", 1700000000)).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    h.http.fail("/chat/read", "connection reset");

    h.console.mark_read(CHAT).await.unwrap();
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_bad_frames_do_not_stop_the_pipeline() {
    let mut h = connected(ClientConfig::new("http://gw")).await;

    h.factory.push_bytes("data: {not json\n\n").await;
    h.factory
        .push_frame(json!({"type": "messages", "data": {"text": "no ids"}}))
        .await;
    h.factory
        .push_frame(json!({"type": "something_else", "data": {}}))
        .await;
    h.factory.push_frame(inbound("S1", "still here", 1700000000)).await;

    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    assert_eq!(h.console.messages(CHAT).len(), 1);
    assert!(h.console.connection_state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_inbound_delivery_is_ignored() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.factory.push_frame(inbound("S1", "hi", 1700000000)).await;
    h.factory.push_frame(inbound("S1", "hi", 1700000000)).await;
    h.factory.push_frame(inbound("S2", "again", 1700000010)).await;

    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;
    wait_for(&mut h.events, |e| matches!(e, Event::MessageAppended { .. })).await;

    assert_eq!(h.console.messages(CHAT).len(), 2);
    assert_eq!(h.console.chat(CHAT).unwrap().unread_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_profile_lookup_is_coalesced_and_fills_roster() {
    let mut h = connected(ClientConfig::new("http://gw")).await;
    h.http.respond_json_after(
        "/chat/profile",
        Duration::from_millis(300),
        200,
        json!({"name": "Ana Souza", "imgUrl": "https://img.example/ana.jpg"}),
    );

    h.factory.push_frame(inbound("S1", "one", 1700000000)).await;
    h.factory.push_frame(inbound("S2", "two", 1700000001)).await;
    h.factory.push_frame(inbound("S3", "three", 1700000002)).await;

    wait_for(&mut h.events, |e| matches!(e, Event::ProfileResolved { .. })).await;
    wait_for(&mut h.events, |e| matches!(e, Event::RosterChanged)).await;

    assert_eq!(h.http.calls("/chat/profile"), 1);
    let chat = h.console.chat(CHAT).unwrap();
    assert_eq!(chat.title(), "Ana Souza");
    assert_eq!(chat.profile_image_url.as_deref(), Some("https://img.example/ana.jpg"));

    let entry = h.console.profile("5511999999999");
    assert_eq!(entry.display_name, "Ana Souza");
}

#[tokio::test(start_paused = true)]
async fn test_blank_text_is_rejected_before_append() {
    let h = connected(ClientConfig::new("http://gw")).await;
    h.http.respond_json(
        "/message/sendText",
        200,
        json!({"key": {"id": "S1"}, "messageTimestamp": 1700000000}),
    );

    for text in ["", "   ", "\n\t"] {
        let err = h.console.send_text(CHAT, text).await.unwrap_err();
        assert!(matches!(err, ConsoleError::EmptyMessage));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.console.messages(CHAT).is_empty());
    assert!(h.console.chat(CHAT).is_none());
    assert_eq!(h.http.calls("/message/sendText"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_actions_require_an_instance() {
    let http = Arc::new(MockHttpClient::new());
    let factory = Arc::new(MockStreamFactory::new());
    let console = ChatConsole::new(ClientConfig::new("http://gw"), http, factory);

    assert!(console.send_text(CHAT, "Hi").await.is_err());
    assert!(console.load_snapshot().await.is_err());
    assert!(console.messages(CHAT).is_empty());
}
