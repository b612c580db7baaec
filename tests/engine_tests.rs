//! End-to-end exchanges against a scripted transport.
//!
//! The transport replays canned responses chunk by chunk, and the recording
//! UI captures every call the engine makes into its collaborators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use relaychat::{
    ByteStream, ChatMessage, ChatRequest, ChatSessionEngine, Collaborators, Credentials,
    EngineConfig, Error, ErrorKind, ExchangeOutcome, ExchangeState, MemorySessionStore,
    NotificationSink, PageController, ProgressSink, RELOAD_ANNOUNCEMENT, ReloadPolicy, Result,
    SessionStore, StaticCredentials, Transport, TranscriptSink, UrlOriginResolver,
};

const PAGE_URL: &str = "https://app.example.com/workflows/42";
const ORIGIN: &str = "app.example.com";

///////////////////////////////////////////// Script ///////////////////////////////////////////

enum Tail {
    Close,
    Hang,
    Fail(Error),
}

enum Scripted {
    Status(u16, &'static str),
    Refuse(Error),
    Body(Vec<Bytes>, Tail),
}

impl Scripted {
    fn body(text: &str) -> Self {
        Scripted::Body(vec![Bytes::from(text.to_string())], Tail::Close)
    }

    fn chunked(text: &str, sizes: &[usize]) -> Self {
        let bytes = text.as_bytes();
        let mut chunks = Vec::new();
        let mut offset = 0;
        let mut sizes = sizes.iter().cycle();
        while offset < bytes.len() {
            let size = (*sizes.next().unwrap_or(&1)).max(1);
            let end = (offset + size).min(bytes.len());
            chunks.push(Bytes::copy_from_slice(&bytes[offset..end]));
            offset = end;
        }
        Scripted::Body(chunks, Tail::Close)
    }
}

#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Scripted>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn gated(replies: Vec<Scripted>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(replies)
        }
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: ChatRequest) -> Result<ByteStream> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("transport called more often than scripted");
        match reply {
            Scripted::Status(status, body) => Err(Error::http(status, body)),
            Scripted::Refuse(err) => Err(err),
            Scripted::Body(chunks, tail) => {
                let tail: ByteStream = match tail {
                    Tail::Close => Box::pin(stream::empty::<Result<Bytes>>()),
                    Tail::Hang => Box::pin(stream::pending::<Result<Bytes>>()),
                    Tail::Fail(err) => {
                        Box::pin(stream::once(async move { Err::<Bytes, Error>(err) }))
                    }
                };
                let head = stream::iter(chunks.into_iter().map(Ok::<Bytes, Error>));
                Ok(Box::pin(futures::StreamExt::chain(head, tail)))
            }
        }
    }
}

//////////////////////////////////////////// Stores //////////////////////////////////////////

/// Session store whose reads and writes can be made to fail, hang or lag.
#[derive(Default)]
struct FaultyStore {
    inner: MemorySessionStore,
    fail_get: bool,
    hang_get: bool,
    fail_set: bool,
    set_delay: Option<Duration>,
}

#[async_trait::async_trait]
impl SessionStore for FaultyStore {
    async fn get(&self, origin: &str) -> Result<Option<String>> {
        if self.hang_get {
            futures::future::pending::<()>().await;
        }
        if self.fail_get {
            return Err(Error::io(
                "failed to read session file",
                std::io::Error::other("device unplugged"),
            ));
        }
        self.inner.get(origin).await
    }

    async fn set(&self, origin: &str, token: &str) -> Result<()> {
        if let Some(delay) = self.set_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_set {
            return Err(Error::storage("session store is read-only", None));
        }
        self.inner.set(origin, token).await
    }

    async fn clear(&self, origin: &str) -> Result<()> {
        self.inner.clear(origin).await
    }
}

/////////////////////////////////////////// Recording UI ///////////////////////////////////////

#[derive(Clone, Debug, PartialEq, Eq)]
enum UiEvent {
    Message(ChatMessage),
    ShowProgress,
    Progress(String),
    HideProgress,
    Completed(String),
    Reload,
    Cleared,
}

#[derive(Default)]
struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.load_all()
    }

    fn progress_texts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::Progress(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &UiEvent) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

impl TranscriptSink for RecordingUi {
    fn append_message(&self, message: ChatMessage) {
        self.push(UiEvent::Message(message));
    }

    fn load_all(&self) -> Vec<ChatMessage> {
        let events = self.events();
        let start = events
            .iter()
            .rposition(|e| *e == UiEvent::Cleared)
            .map(|i| i + 1)
            .unwrap_or(0);
        events[start..]
            .iter()
            .filter_map(|event| match event {
                UiEvent::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn clear(&self) {
        self.push(UiEvent::Cleared);
    }
}

impl ProgressSink for RecordingUi {
    fn show_progress(&self) {
        self.push(UiEvent::ShowProgress);
    }

    fn update_progress(&self, text: &str) {
        self.push(UiEvent::Progress(text.to_string()));
    }

    fn hide_progress(&self) {
        self.push(UiEvent::HideProgress);
    }
}

impl NotificationSink for RecordingUi {
    fn request_completed(&self, origin: &str) {
        self.push(UiEvent::Completed(origin.to_string()));
    }
}

impl PageController for RecordingUi {
    fn reload(&self) {
        self.push(UiEvent::Reload);
    }
}

///////////////////////////////////////////// Harness //////////////////////////////////////////

struct Harness {
    engine: ChatSessionEngine,
    transport: Arc<ScriptedTransport>,
    ui: Arc<RecordingUi>,
    sessions: Arc<dyn SessionStore>,
}

fn signed_in() -> Credentials {
    Credentials::default()
        .with_auth_token("user-token")
        .with_api_key("backend-key")
}

fn quiet_config() -> EngineConfig {
    EngineConfig::new().with_reload(ReloadPolicy::Disabled)
}

fn harness_with(
    transport: ScriptedTransport,
    credentials: Credentials,
    page_url: &str,
    config: EngineConfig,
) -> Harness {
    harness_with_store(
        transport,
        credentials,
        page_url,
        config,
        Arc::new(MemorySessionStore::new()),
    )
}

fn harness_with_store(
    transport: ScriptedTransport,
    credentials: Credentials,
    page_url: &str,
    config: EngineConfig,
    sessions: Arc<dyn SessionStore>,
) -> Harness {
    let transport = Arc::new(transport);
    let ui = Arc::new(RecordingUi::default());
    let collaborators = Collaborators {
        credentials: Arc::new(StaticCredentials::new(credentials)),
        origin: Arc::new(UrlOriginResolver::new(page_url)),
        transport: transport.clone(),
        sessions: Arc::clone(&sessions),
        transcript: ui.clone(),
        progress: ui.clone(),
        notifications: ui.clone(),
        page: ui.clone(),
    };
    Harness {
        engine: ChatSessionEngine::new(config, collaborators),
        transport,
        ui,
        sessions,
    }
}

fn harness(replies: Vec<Scripted>) -> Harness {
    harness_with(
        ScriptedTransport::new(replies),
        signed_in(),
        PAGE_URL,
        quiet_config(),
    )
}

fn progress(text: &str) -> String {
    format!(
        "data: {}\n",
        json!({"type": "progress-update", "data": text})
    )
}

fn result(text: &str, session_id: &str) -> String {
    let payload = json!({"text": text, "session_id": session_id}).to_string();
    format!("data: {}\n", json!({"type": "result", "data": payload}))
}

fn error_event(message: &str) -> String {
    format!("data: {}\n", json!({"type": "error", "data": message}))
}

////////////////////////////////////////////// Tests ///////////////////////////////////////////

#[tokio::test]
async fn progress_then_result_completes_and_stores_token() {
    let body = [progress("A"), progress("B"), result("done", "s1")].concat();
    let h = harness(vec![Scripted::body(&body)]);

    let outcome = h.engine.send("  hi  ").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("done".to_string()));
    assert_eq!(h.engine.state(), ExchangeState::Completed);
    assert_eq!(
        h.ui.events(),
        vec![
            UiEvent::Message(ChatMessage::user("hi")),
            UiEvent::ShowProgress,
            UiEvent::Progress("A".to_string()),
            UiEvent::Progress("B".to_string()),
            UiEvent::HideProgress,
            UiEvent::Message(ChatMessage::assistant("done")),
            UiEvent::Completed(ORIGIN.to_string()),
        ]
    );
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), Some("s1".to_string()));
    assert!(!h.engine.is_in_flight(ORIGIN));
}

#[tokio::test]
async fn request_carries_context_and_session() {
    let h = harness(vec![
        Scripted::body(&result("first", "s1")),
        Scripted::body(&result("second", "s2")),
    ]);

    h.engine.send("one").await.unwrap();
    h.engine.send("two").await.unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].message, "one");
    assert_eq!(requests[0].auth_token, "user-token");
    assert_eq!(requests[0].api_key, "backend-key");
    assert_eq!(requests[0].api_url, "https://app.example.com/");
    assert_eq!(requests[0].session_id, None);
    assert_eq!(requests[1].session_id, Some("s1".to_string()));
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), Some("s2".to_string()));

    let wire = serde_json::to_value(&requests[0]).unwrap();
    assert!(wire["session_id"].is_null());
    assert!(wire.get("anthropic_key").is_none());
}

#[tokio::test]
async fn chunk_boundaries_do_not_change_the_outcome() {
    let body = [
        progress("Reading the workflow…"),
        "\r\n: keep-alive\n".to_string(),
        progress("Écrit ✓"),
        result("ready ✓", "s9"),
    ]
    .concat();
    let splits: &[&[usize]] = &[&[1], &[2, 3], &[7], &[5, 1, 13], &[body.len()]];

    let mut observed = Vec::new();
    for sizes in splits {
        let h = harness(vec![Scripted::chunked(&body, sizes)]);
        let outcome = h.engine.send("go").await.unwrap();
        observed.push((
            outcome,
            h.ui.progress_texts(),
            h.ui.messages(),
            h.transport.requests().len(),
        ));
    }
    for other in &observed[1..] {
        assert_eq!(other, &observed[0]);
    }
    assert_eq!(
        observed[0].1,
        vec!["Reading the workflow…".to_string(), "Écrit ✓".to_string()]
    );
    assert_eq!(
        observed[0].0,
        ExchangeOutcome::Completed("ready ✓".to_string())
    );
}

#[tokio::test]
async fn http_error_shows_body_without_streaming() {
    let h = harness(vec![Scripted::Status(401, "bad key")]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert_eq!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::HttpError, "bad key".to_string())
    );
    assert_eq!(h.engine.state(), ExchangeState::Failed);
    assert_eq!(
        h.ui.events(),
        vec![
            UiEvent::Message(ChatMessage::user("hi")),
            UiEvent::Message(ChatMessage::assistant("Server Error: bad key")),
        ]
    );
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);
}

#[tokio::test]
async fn network_refusal_uses_generic_message() {
    let h = harness(vec![Scripted::Refuse(Error::network(
        "connection refused",
        None,
    ))]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::NetworkError, _)
    ));
    assert_eq!(
        h.ui.messages().last().unwrap().text,
        "Network Error: Unable to reach server. Please check your connection."
    );
}

#[tokio::test]
async fn server_error_event_fails_with_server_text() {
    let body = [progress("working"), error_event("quota exhausted")].concat();
    let h = harness(vec![Scripted::body(&body)]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert_eq!(
        outcome,
        ExchangeOutcome::Failed(
            ErrorKind::ServerReportedError,
            "quota exhausted".to_string()
        )
    );
    assert_eq!(h.ui.count(&UiEvent::ShowProgress), 1);
    assert_eq!(h.ui.count(&UiEvent::HideProgress), 1);
    assert_eq!(
        h.ui.messages(),
        vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("Error: quota exhausted"),
        ]
    );
    assert_eq!(h.ui.count(&UiEvent::Completed(ORIGIN.to_string())), 0);
}

#[tokio::test]
async fn stream_closing_without_terminal_fails() {
    let h = harness(vec![Scripted::body(&progress("almost"))]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::StreamEndedWithoutTerminal, _)
    ));
    assert_eq!(h.ui.count(&UiEvent::HideProgress), 1);
    assert_eq!(h.ui.messages().len(), 2);
}

#[tokio::test]
async fn stream_error_mid_body_is_a_network_failure() {
    let h = harness(vec![Scripted::Body(
        vec![Bytes::from(progress("step 1"))],
        Tail::Fail(Error::network("connection reset", None)),
    )]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::NetworkError, _)
    ));
    assert_eq!(h.ui.progress_texts(), vec!["step 1".to_string()]);
}

#[tokio::test]
async fn only_the_first_terminal_event_counts() {
    let body = [
        result("first", "s1"),
        error_event("too late"),
        result("second", "s2"),
    ]
    .concat();
    let h = harness(vec![Scripted::body(&body)]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("first".to_string()));
    assert_eq!(
        h.ui.messages(),
        vec![ChatMessage::user("hi"), ChatMessage::assistant("first")]
    );
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), Some("s1".to_string()));
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let body = [
        "data: {not json\n".to_string(),
        "data: {\"type\":\"telemetry\",\"data\":1}\n".to_string(),
        progress("still here"),
        result("ok", "s1"),
    ]
    .concat();
    let h = harness(vec![Scripted::body(&body)]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("ok".to_string()));
    assert_eq!(h.ui.progress_texts(), vec!["still here".to_string()]);
}

#[tokio::test]
async fn undecodable_result_payload_is_fatal() {
    let body = [
        "data: {\"type\":\"result\",\"data\":\"{broken\"}\n".to_string(),
        result("never", "s1"),
    ]
    .concat();
    let h = harness(vec![Scripted::body(&body)]);

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::StreamTerminalParseFailure, _)
    ));
    assert_eq!(h.ui.messages().len(), 2);
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);
}

#[tokio::test]
async fn missing_token_fails_before_any_request() {
    let h = harness_with(
        ScriptedTransport::new(Vec::new()),
        Credentials::default().with_api_key("backend-key"),
        PAGE_URL,
        quiet_config(),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::MissingCredential, _)
    ));
    assert!(h.transport.requests().is_empty());
    assert_eq!(
        h.ui.events(),
        vec![
            UiEvent::Message(ChatMessage::user("hi")),
            UiEvent::Message(ChatMessage::assistant(
                "Error: Please sign in before chatting."
            )),
        ]
    );
}

#[tokio::test]
async fn missing_key_fails_before_any_request() {
    let h = harness_with(
        ScriptedTransport::new(Vec::new()),
        Credentials::default().with_auth_token("user-token"),
        PAGE_URL,
        quiet_config(),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::MissingConfig, _)
    ));
    assert!(h.transport.requests().is_empty());
}

#[tokio::test]
async fn unresolvable_origin_fails_before_any_request() {
    let h = harness_with(
        ScriptedTransport::new(Vec::new()),
        signed_in(),
        "not a url",
        quiet_config(),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::OriginResolutionFailure, _)
    ));
    assert!(h.transport.requests().is_empty());
    assert_eq!(
        h.ui.messages().last().unwrap().text,
        "Error: Could not determine API URL from current page."
    );
}

#[tokio::test]
async fn blank_message_is_rejected() {
    let h = harness(Vec::new());

    let err = h.engine.send(" \n\t ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyMessage);
    assert!(h.ui.events().is_empty());
    assert_eq!(h.engine.state(), ExchangeState::Idle);
}

#[tokio::test]
async fn one_exchange_per_origin() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(
        ScriptedTransport::gated(vec![Scripted::body(&result("done", "s1"))], gate.clone()),
        signed_in(),
        PAGE_URL,
        quiet_config(),
    );

    let (first, second) = tokio::join!(h.engine.send("first"), async {
        let rejected = h.engine.send("second").await;
        assert!(h.engine.is_in_flight(ORIGIN));
        gate.notify_one();
        rejected
    });

    assert_eq!(
        first.unwrap(),
        ExchangeOutcome::Completed("done".to_string())
    );
    assert_eq!(second.unwrap_err().kind(), ErrorKind::ExchangeInFlight);
    assert_eq!(h.transport.requests().len(), 1);
    assert_eq!(
        h.ui.messages(),
        vec![ChatMessage::user("first"), ChatMessage::assistant("done")]
    );
    assert!(!h.engine.is_in_flight(ORIGIN));
}

#[tokio::test]
async fn clear_history_forgets_the_session() {
    let h = harness(vec![
        Scripted::body(&result("hello", "s1")),
        Scripted::body(&result("fresh", "s2")),
    ]);

    h.engine.send("one").await.unwrap();
    assert_eq!(
        h.engine.session().await.unwrap().continuation_token,
        Some("s1".to_string())
    );

    h.engine.clear_history().await.unwrap();
    assert!(h.ui.messages().is_empty());
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);

    h.engine.send("two").await.unwrap();
    assert_eq!(h.transport.requests()[1].session_id, None);
}

#[tokio::test]
async fn clear_history_cancels_running_exchange() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(
        ScriptedTransport::gated(vec![Scripted::body(&result("fresh", "s2"))], gate.clone()),
        signed_in(),
        PAGE_URL,
        quiet_config(),
    );

    let (outcome, cleared) = tokio::join!(h.engine.send("first"), h.engine.clear_history());
    cleared.unwrap();
    assert_eq!(outcome.unwrap(), ExchangeOutcome::Cancelled);
    assert!(!h.engine.is_in_flight(ORIGIN));
    assert!(h.ui.messages().is_empty());
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);

    // The cancelled request never took its scripted reply; let the next one through.
    gate.notify_one();
    let outcome = h.engine.send("second").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("fresh".to_string()));
    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].session_id, None);
    assert_eq!(
        h.ui.messages(),
        vec![ChatMessage::user("second"), ChatMessage::assistant("fresh")]
    );
}

#[tokio::test(start_paused = true)]
async fn clear_history_waits_for_a_finishing_exchange() {
    let store = FaultyStore {
        set_delay: Some(Duration::from_secs(1)),
        ..FaultyStore::default()
    };
    let h = harness_with_store(
        ScriptedTransport::new(vec![Scripted::body(&result("late", "s1"))]),
        signed_in(),
        PAGE_URL,
        quiet_config(),
        Arc::new(store),
    );

    let (outcome, cleared) = tokio::join!(h.engine.send("first"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.engine.is_in_flight(ORIGIN));
        h.engine.clear_history().await
    });
    cleared.unwrap();

    assert_eq!(outcome.unwrap(), ExchangeOutcome::Completed("late".to_string()));
    assert!(h.ui.messages().is_empty());
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);
    assert_eq!(h.engine.session().await.unwrap().continuation_token, None);
}

#[tokio::test(start_paused = true)]
async fn clear_history_aborts_pending_reload() {
    let h = harness_with(
        ScriptedTransport::new(vec![Scripted::body(&result("done", "s1"))]),
        signed_in(),
        PAGE_URL,
        EngineConfig::new(),
    );

    h.engine.send("hi").await.unwrap();
    assert!(h.engine.reload_pending());
    h.engine.clear_history().await.unwrap();
    assert!(!h.engine.reload_pending());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.ui.count(&UiEvent::Reload), 0);
    assert!(h.ui.messages().is_empty());
}

#[tokio::test]
async fn store_read_failure_fails_before_any_request() {
    let store = FaultyStore {
        fail_get: true,
        ..FaultyStore::default()
    };
    let h = harness_with_store(
        ScriptedTransport::new(Vec::new()),
        signed_in(),
        PAGE_URL,
        quiet_config(),
        Arc::new(store),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::StorageFailure, _)
    ));
    assert_eq!(h.engine.state(), ExchangeState::Failed);
    assert!(h.transport.requests().is_empty());
    let messages = h.ui.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].text.starts_with("Error: "));
    assert_eq!(h.ui.count(&UiEvent::ShowProgress), 0);
    assert!(!h.engine.is_in_flight(ORIGIN));
}

#[tokio::test(start_paused = true)]
async fn stalled_store_read_times_out_as_storage_failure() {
    let store = FaultyStore {
        hang_get: true,
        ..FaultyStore::default()
    };
    let h = harness_with_store(
        ScriptedTransport::new(Vec::new()),
        signed_in(),
        PAGE_URL,
        quiet_config().with_store_timeout(Duration::from_millis(100)),
        Arc::new(store),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::StorageFailure, _)
    ));
    assert!(h.transport.requests().is_empty());
    assert_eq!(h.ui.messages().len(), 2);
    assert!(!h.engine.is_in_flight(ORIGIN));
}

#[tokio::test]
async fn token_write_failure_still_completes() {
    let store = FaultyStore {
        fail_set: true,
        ..FaultyStore::default()
    };
    let h = harness_with_store(
        ScriptedTransport::new(vec![Scripted::body(&result("done", "s1"))]),
        signed_in(),
        PAGE_URL,
        quiet_config(),
        Arc::new(store),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("done".to_string()));
    assert_eq!(h.engine.state(), ExchangeState::Completed);
    assert_eq!(
        h.ui.messages(),
        vec![ChatMessage::user("hi"), ChatMessage::assistant("done")]
    );
    assert_eq!(h.ui.count(&UiEvent::Completed(ORIGIN.to_string())), 1);
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);
}

#[tokio::test]
async fn cancellation_shows_nothing() {
    let h = harness(vec![Scripted::Body(
        vec![Bytes::from(progress("thinking"))],
        Tail::Hang,
    )]);
    let cancel = CancellationToken::new();

    let (outcome, ()) = tokio::join!(h.engine.send_with_cancel("hi", cancel.clone()), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    assert_eq!(outcome.unwrap(), ExchangeOutcome::Cancelled);
    assert_eq!(h.engine.state(), ExchangeState::Cancelled);
    assert_eq!(h.ui.messages(), vec![ChatMessage::user("hi")]);
    assert_eq!(h.ui.count(&UiEvent::HideProgress), 1);
    assert!(!h.engine.is_in_flight(ORIGIN));
    assert_eq!(h.sessions.get(ORIGIN).await.unwrap(), None);
}

#[tokio::test]
async fn cancel_all_aborts_running_sends() {
    let h = harness(vec![
        Scripted::Body(Vec::new(), Tail::Hang),
        Scripted::body(&result("after", "s1")),
    ]);

    let (outcome, ()) = tokio::join!(h.engine.send("hi"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.cancel_all();
    });
    assert_eq!(outcome.unwrap(), ExchangeOutcome::Cancelled);

    let outcome = h.engine.send("again").await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Completed("after".to_string()));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_fails_as_network_error() {
    let h = harness_with(
        ScriptedTransport::new(vec![Scripted::Body(
            vec![Bytes::from(progress("one"))],
            Tail::Hang,
        )]),
        signed_in(),
        PAGE_URL,
        quiet_config().with_idle_timeout(Some(Duration::from_secs(30))),
    );

    let outcome = h.engine.send("hi").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ErrorKind::NetworkError, _)
    ));
    assert_eq!(h.ui.count(&UiEvent::HideProgress), 1);
}

#[tokio::test(start_paused = true)]
async fn completion_schedules_staged_reload() {
    let h = harness_with(
        ScriptedTransport::new(vec![Scripted::body(&result("done", "s1"))]),
        signed_in(),
        PAGE_URL,
        EngineConfig::new(),
    );

    h.engine.send("hi").await.unwrap();
    assert!(h.engine.reload_pending());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        h.ui.messages().last(),
        Some(&ChatMessage::assistant(RELOAD_ANNOUNCEMENT))
    );
    assert_eq!(h.ui.count(&UiEvent::Reload), 0);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(h.ui.count(&UiEvent::Reload), 1);
    assert!(!h.engine.reload_pending());
}

#[tokio::test(start_paused = true)]
async fn new_send_aborts_pending_reload() {
    let h = harness_with(
        ScriptedTransport::new(vec![
            Scripted::body(&result("done", "s1")),
            Scripted::Status(500, "boom"),
        ]),
        signed_in(),
        PAGE_URL,
        EngineConfig::new(),
    );

    h.engine.send("hi").await.unwrap();
    assert!(h.engine.reload_pending());
    h.engine.send("again").await.unwrap();
    assert!(!h.engine.reload_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.ui.count(&UiEvent::Reload), 0);
    assert!(
        !h.ui
            .messages()
            .contains(&ChatMessage::assistant(RELOAD_ANNOUNCEMENT))
    );
}

#[tokio::test(start_paused = true)]
async fn failures_do_not_schedule_reload() {
    let h = harness_with(
        ScriptedTransport::new(vec![Scripted::Status(503, "unavailable")]),
        signed_in(),
        PAGE_URL,
        EngineConfig::new(),
    );

    h.engine.send("hi").await.unwrap();
    assert!(!h.engine.reload_pending());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.ui.count(&UiEvent::Reload), 0);
}
