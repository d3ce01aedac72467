//! End-to-end chat session tests against an in-memory hub

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use supportdesk_realtime::api_client::ApiResult;
use supportdesk_realtime::hub::{HubFrame, HubLink, HubTransport};
use supportdesk_realtime::{
    ApiClientError, AssistantClient, AttachmentUploader, BatchConfig, ChatError, ChatServices,
    ChatSession, ConnectionState, FileUpload, HistorySource, HubConnection, HubError, HubResult,
    ReconnectPolicy, StaticIdentity,
};
use supportdesk_shared::{
    AssistantRequest, AssistantResponse, Attachment, Message, Sender, UserId,
};
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

// =============================================================================
// In-memory hub
// =============================================================================

/// Hub server that acknowledges every invocation and can echo sent messages
#[derive(Default)]
struct FakeHub {
    echo: AtomicBool,
    refuse: AtomicBool,
    connects: AtomicUsize,
    sent: Arc<Mutex<Vec<Value>>>,
    completion_result: Arc<Mutex<Option<Value>>>,
    servers: Mutex<Vec<(JoinHandle<()>, mpsc::UnboundedSender<HubFrame>)>>,
}

impl FakeHub {
    fn echoing() -> Self {
        let hub = Self::default();
        hub.echo.store(true, Ordering::SeqCst);
        hub
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Drop every open link as if the network went away
    fn kill_links(&self) {
        for (task, _) in self.servers.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Push a frame to the client over the newest link
    fn push(&self, frame: HubFrame) {
        let servers = self.servers.lock().unwrap();
        let (_, inject) = servers.last().expect("no open link");
        inject.send(frame).unwrap();
    }
}

#[async_trait]
impl HubTransport for FakeHub {
    async fn connect(&self, _url: &Url) -> HubResult<HubLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(HubError::Connect("hub unreachable".to_string()));
        }

        let (client_tx, mut server_rx) = mpsc::unbounded_channel::<HubFrame>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<HubFrame>();
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<HubFrame>();
        let sent = Arc::clone(&self.sent);
        let completion_result = Arc::clone(&self.completion_result);
        let echo = self.echo.load(Ordering::SeqCst);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = server_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let HubFrame::Invocation { invocation_id: Some(id), target, arguments } = frame else {
                            continue;
                        };

                        if target == "SendMessage" {
                            let count = {
                                let mut sent = sent.lock().unwrap();
                                sent.push(arguments[0].clone());
                                sent.len()
                            };
                            if echo {
                                let mut message = arguments[0].clone();
                                message["id"] = json!(format!("srv-{}", count));
                                let _ = server_tx.send(HubFrame::Invocation {
                                    invocation_id: None,
                                    target: "ReceiveMessage".to_string(),
                                    arguments: vec![message],
                                });
                            }
                        }

                        let result = completion_result.lock().unwrap().clone();
                        let _ = server_tx.send(HubFrame::Completion {
                            invocation_id: id,
                            result,
                            error: None,
                        });
                    }
                    frame = inject_rx.recv() => match frame {
                        Some(frame) => {
                            let _ = server_tx.send(frame);
                        }
                        None => break,
                    }
                }
            }
        });

        self.servers.lock().unwrap().push((task, inject_tx));
        Ok(HubLink::new(client_tx, client_rx))
    }
}

// =============================================================================
// HTTP collaborators
// =============================================================================

#[derive(Default)]
struct MemoryHistory {
    pages: Mutex<VecDeque<Vec<Message>>>,
    calls: AtomicUsize,
}

#[async_trait]
impl HistorySource for MemoryHistory {
    async fn fetch_history(
        &self,
        _user: &UserId,
        _before: Option<OffsetDateTime>,
        _limit: usize,
    ) -> ApiResult<Vec<Message>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeUploader {
    fail_on: Option<String>,
    uploaded: Mutex<Vec<String>>,
}

#[async_trait]
impl AttachmentUploader for FakeUploader {
    async fn upload(&self, file: &FileUpload) -> ApiResult<Attachment> {
        if self.fail_on.as_deref() == Some(file.name.as_str()) {
            return Err(ApiClientError::Status {
                status: 500,
                body: "storage full".to_string(),
            });
        }
        self.uploaded.lock().unwrap().push(file.name.clone());
        Ok(Attachment {
            name: file.name.clone(),
            url: format!("https://files.example.com/{}", file.name),
        })
    }
}

/// Transport whose connect never completes
struct StalledHub;

#[async_trait]
impl HubTransport for StalledHub {
    async fn connect(&self, _url: &Url) -> HubResult<HubLink> {
        std::future::pending().await
    }
}

struct EchoAssistant;

#[async_trait]
impl AssistantClient for EchoAssistant {
    async fn ask(&self, request: &AssistantRequest) -> ApiResult<AssistantResponse> {
        Ok(AssistantResponse {
            response: format!("You asked: {}", request.prompt),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    hub: Arc<FakeHub>,
    history: Arc<MemoryHistory>,
    uploader: Arc<FakeUploader>,
    session: ChatSession,
}

fn harness(hub: FakeHub, user: Option<&str>, fail_upload: Option<&str>) -> Harness {
    let hub = Arc::new(hub);
    let history = Arc::new(MemoryHistory::default());
    let uploader = Arc::new(FakeUploader {
        fail_on: fail_upload.map(str::to_string),
        ..FakeUploader::default()
    });

    let connection = HubConnection::new(
        Url::parse("http://localhost:5000/chatHub").unwrap(),
        hub.clone(),
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        },
    );
    let services = ChatServices {
        history: history.clone(),
        uploader: uploader.clone(),
        assistant: Arc::new(EchoAssistant),
        identity: Arc::new(StaticIdentity::new(user.map(UserId::new))),
    };

    Harness {
        hub,
        history,
        uploader,
        session: ChatSession::new(connection, services, BatchConfig::default()),
    }
}

async fn wait_for_state(session: &ChatSession, done: impl Fn(&ConnectionState) -> bool) {
    let mut states = session.watch_connection();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| done(state)))
        .await
        .expect("connection state did not settle in time")
        .unwrap();
}

fn history_message(id: &str, minute: i64) -> Message {
    Message::new(
        Sender::Agent,
        Some(format!("history {}", id)),
        datetime!(2024-05-01 10:00:00 UTC) + time::Duration::minutes(minute),
    )
    .with_id(id)
}

async fn wait_for_messages(session: &ChatSession, count: usize) -> Arc<[Message]> {
    let mut rx = session.subscribe_messages();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|messages| messages.len() >= count),
    )
    .await
    .expect("messages were not published in time")
    .unwrap()
    .clone();
    result
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_message_is_echoed_exactly_once() {
    let h = harness(FakeHub::echoing(), Some("user-1"), None);
    h.session.activate().await.unwrap();
    wait_for_state(&h.session, ConnectionState::is_connected).await;

    h.session.send_message("Hello", Vec::new()).await.unwrap();

    let sent = h.hub.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["content"], "Hello");
    assert_eq!(sent[0]["sender"], "user");
    assert_eq!(sent[0]["attachments"], json!([]));

    let messages = wait_for_messages(&h.session, 1).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content.as_deref(), Some("Hello"));
    assert_eq!(messages[0].sender, Sender::User);

    // Several sweeps later there is still exactly one copy
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.session.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_happens_before_network() {
    let anonymous = harness(FakeHub::default(), None, None);
    let err = anonymous
        .session
        .send_message("Hello", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotAuthenticated));
    assert!(err.is_client_error());

    let h = harness(FakeHub::default(), Some("user-1"), None);
    let err = h.session.send_message("   ", Vec::new()).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    assert_eq!(anonymous.hub.connects.load(Ordering::SeqCst), 0);
    assert_eq!(h.hub.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attachments_are_uploaded_before_sending() {
    let h = harness(FakeHub::default(), Some("user-1"), None);

    h.session
        .send_message(
            "",
            vec![
                FileUpload::new("screenshot.png", vec![1, 2, 3]).with_content_type("image/png"),
                FileUpload::new("log.txt", b"trace".to_vec()),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        *h.uploader.uploaded.lock().unwrap(),
        vec!["screenshot.png".to_string(), "log.txt".to_string()]
    );
    let sent = h.hub.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0]["attachments"][1]["url"],
        "https://files.example.com/log.txt"
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_aborts_send() {
    let h = harness(FakeHub::default(), Some("user-1"), Some("broken.pdf"));
    h.session.activate().await.unwrap();

    let err = h
        .session
        .send_message(
            "see attached",
            vec![
                FileUpload::new("ok.png", vec![0]),
                FileUpload::new("broken.pdf", vec![0]),
            ],
        )
        .await
        .unwrap_err();

    match err {
        ChatError::Upload { name, .. } => assert_eq!(name, "broken.pdf"),
        other => panic!("Expected upload error, got: {:?}", other),
    }
    assert!(h.hub.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_known_connection_error_fails_fast_until_reconnect() {
    let hub = FakeHub::default();
    hub.refuse.store(true, Ordering::SeqCst);
    let h = harness(hub, Some("user-1"), None);

    // Activation survives an unreachable hub and records the error
    h.session.activate().await.unwrap();
    wait_for_state(&h.session, |s| matches!(s, ConnectionState::Failed(_))).await;
    assert!(h.session.connection_error().is_some());
    let connects = h.hub.connects.load(Ordering::SeqCst);

    let err = h.session.send_message("Hello", Vec::new()).await.unwrap_err();
    assert!(matches!(err, ChatError::ConnectionUnavailable(_)));
    assert_eq!(h.hub.connects.load(Ordering::SeqCst), connects);

    h.hub.refuse.store(false, Ordering::SeqCst);
    h.session.reconnect().await.unwrap();
    assert!(h.session.connection_error().is_none());

    h.session.send_message("Hello", Vec::new()).await.unwrap();
    assert_eq!(h.hub.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_and_keeps_receiving() {
    let h = harness(FakeHub::echoing(), Some("user-1"), None);
    h.session.activate().await.unwrap();
    wait_for_state(&h.session, ConnectionState::is_connected).await;
    let mut states = h.session.watch_connection();

    h.hub.refuse.store(true, Ordering::SeqCst);
    h.hub.kill_links();
    states
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();

    h.hub.refuse.store(false, Ordering::SeqCst);
    states.wait_for(|s| s.is_connected()).await.unwrap();
    assert!(h.session.connection_error().is_none());

    // The subscription outlives the old link
    h.hub.push(HubFrame::Invocation {
        invocation_id: None,
        target: "ReceiveMessage".to_string(),
        arguments: vec![json!({
            "id": "agent-1",
            "content": "Are you still there?",
            "sender": "agent",
            "timestamp": "2024-05-01T10:05:00Z"
        })],
    });

    let messages = wait_for_messages(&h.session, 1).await;
    assert_eq!(messages[0].id, "agent-1");
    assert_eq!(messages[0].sender, Sender::Agent);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_reconnecting_is_not_dropped() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    h.session.activate().await.unwrap();
    wait_for_state(&h.session, ConnectionState::is_connected).await;
    let mut states = h.session.watch_connection();

    h.hub.refuse.store(true, Ordering::SeqCst);
    h.hub.kill_links();
    states
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();

    let hub = Arc::clone(&h.hub);
    let unblock = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.refuse.store(false, Ordering::SeqCst);
    });

    h.session.send_message("queued", Vec::new()).await.unwrap();
    unblock.await.unwrap();

    let sent = h.hub.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["content"], "queued");
}

#[tokio::test(start_paused = true)]
async fn test_history_is_loaded_and_paged() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    let first_page: Vec<Message> = (0..50).map(|i| history_message(&format!("h{}", i), 100 + i)).collect();
    h.history.pages.lock().unwrap().push_back(first_page);
    h.history
        .pages
        .lock()
        .unwrap()
        .push_back(vec![history_message("old", 1)]);

    h.session.activate().await.unwrap();
    assert_eq!(h.session.messages().len(), 50);
    assert!(h.session.has_more());
    assert!(!h.session.is_loading());

    // Newest first
    let messages = h.session.messages();
    assert_eq!(messages[0].id, "h49");
    assert!(messages.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    assert_eq!(h.session.load_more_messages().await.unwrap(), 1);
    assert!(!h.session.has_more());
    assert_eq!(h.session.messages().last().unwrap().id, "old");

    // Exhausted source is not asked again
    assert_eq!(h.session.load_more_messages().await.unwrap(), 0);
    assert_eq!(h.history.calls.load(Ordering::SeqCst), 2);

    h.session.clear_messages();
    assert!(h.session.messages().is_empty());
    assert!(h.session.has_more());
}

#[tokio::test(start_paused = true)]
async fn test_assistant_reply_joins_conversation() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    h.session.activate().await.unwrap();

    let reply = h.session.ask_assistant("How do I reset my password?").await.unwrap();
    assert_eq!(reply.sender, Sender::Automated);

    let messages = wait_for_messages(&h.session, 1).await;
    assert_eq!(
        messages[0].content.as_deref(),
        Some("You asked: How do I reset my password?")
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_releases_everything_once() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    h.session.activate().await.unwrap();
    h.session.activate().await.unwrap();

    let hub = h.session.hub().clone();
    assert_eq!(hub.listener_count(), 1);

    h.session.close();
    h.session.close();

    assert!(hub.is_disposed());
    assert_eq!(hub.listener_count(), 0);
    assert_eq!(hub.state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.session.send_message("late", Vec::new()).await,
        Err(ChatError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_session_disposes_hub() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    h.session.activate().await.unwrap();
    let hub = h.session.hub().clone();

    drop(h);

    assert!(hub.is_disposed());
    assert_eq!(hub.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_history_loads_while_hub_is_stuck_connecting() {
    let history = Arc::new(MemoryHistory::default());
    history
        .pages
        .lock()
        .unwrap()
        .push_back(vec![history_message("h1", 0)]);

    let connection = HubConnection::new(
        Url::parse("http://localhost:5000/chatHub").unwrap(),
        Arc::new(StalledHub),
        ReconnectPolicy::default(),
    );
    let services = ChatServices {
        history: history.clone(),
        uploader: Arc::new(FakeUploader::default()),
        assistant: Arc::new(EchoAssistant),
        identity: Arc::new(StaticIdentity::new(Some(UserId::new("user-1")))),
    };
    let session = ChatSession::new(connection, services, BatchConfig::default());

    tokio::time::timeout(Duration::from_secs(2), session.activate())
        .await
        .expect("activation waited on the hub")
        .unwrap();

    assert_eq!(history.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages().len(), 1);
    wait_for_state(&session, |s| *s == ConnectionState::Connecting).await;

    let hub = session.hub().clone();
    session.close();
    assert!(hub.is_disposed());
    assert_eq!(hub.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_send_accepts_any_completion_result() {
    let h = harness(FakeHub::default(), Some("user-1"), None);
    *h.hub.completion_result.lock().unwrap() = Some(json!({ "id": "srv-9", "stored": true }));

    h.session.send_message("Hello", Vec::new()).await.unwrap();
    assert_eq!(h.hub.sent().len(), 1);
}
