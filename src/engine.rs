//! The chat session engine.
//!
//! One call to [`ChatSessionEngine::send`] runs one exchange:
//!
//! ```text
//! Idle -> Sending -> Streaming -> Completed
//!            |           |------> Failed
//!            |           `------> Cancelled
//!            `------------------> Failed
//! ```
//!
//! The continuation token for the origin is read once when the exchange
//! starts.  At most one exchange per origin runs at a time, and at most one
//! terminal event per exchange is acted on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::context::{CredentialProvider, OriginResolver, PageOrigin};
use crate::decoder;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{ParsedLine, ProtocolEvent, parse_line};
use crate::observability::{
    EXCHANGES_CANCELLED, EXCHANGES_COMPLETED, EXCHANGES_FAILED, EXCHANGES_REJECTED,
    EXCHANGES_STARTED, STREAM_DURATION, STREAM_EVENTS, STREAM_MALFORMED_LINES, STREAM_TTFB,
};
use crate::reload::ReloadScheduler;
use crate::session_store::SessionStore;
use crate::transcript::{ChatMessage, TranscriptSink};
use crate::transport::{ChatRequest, Transport};
use crate::widget::{NotificationSink, PageController, ProgressSink};

/// Lifecycle of one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    /// Nothing has been sent.
    Idle,
    /// Preconditions checked, request on its way.
    Sending,
    /// Initial response accepted; events are streaming in.
    Streaming,
    /// A result arrived.
    Completed,
    /// The exchange failed; one error message was shown.
    Failed,
    /// The host aborted the exchange; nothing was shown.
    Cancelled,
}

impl ExchangeState {
    /// Returns true for states that end an exchange.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Cancelled
        )
    }
}

/// How an exchange ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The reply text.
    Completed(String),
    /// The failure class and its human-readable detail.
    Failed(ErrorKind, String),
    /// Aborted by the host.
    Cancelled,
}

/// The continuation state of one origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSession {
    /// Origin the conversation is scoped to.
    pub origin_key: String,
    /// Token the next exchange will resume from.
    pub continuation_token: Option<String>,
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Supplies auth token and API keys.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Resolves the current page origin.
    pub origin: Arc<dyn OriginResolver>,
    /// Sends the chat request.
    pub transport: Arc<dyn Transport>,
    /// Continuation tokens per origin.
    pub sessions: Arc<dyn SessionStore>,
    /// Conversation shown to the user.
    pub transcript: Arc<dyn TranscriptSink>,
    /// Loading indicator.
    pub progress: Arc<dyn ProgressSink>,
    /// Completion signal.
    pub notifications: Arc<dyn NotificationSink>,
    /// Hosting page.
    pub page: Arc<dyn PageController>,
}

/// Origins with an exchange in `Sending` or `Streaming`.
///
/// Each claim carries the cancellation token of its exchange so the origin
/// can be interrupted from outside the exchange.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    origins: Mutex<HashMap<String, CancellationToken>>,
    released: Notify,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.origins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `origin` for an exchange driven by `cancel`, or fails with
    /// [`ErrorKind::ExchangeInFlight`].
    pub fn try_acquire(
        &self,
        origin: &str,
        cancel: CancellationToken,
    ) -> Result<InFlightGuard<'_>> {
        let mut origins = self.lock();
        if origins.contains_key(origin) {
            return Err(Error::in_flight(origin));
        }
        origins.insert(origin.to_string(), cancel);
        Ok(InFlightGuard {
            registry: self,
            origin: origin.to_string(),
        })
    }

    /// Returns true if `origin` has an exchange running.
    pub fn contains(&self, origin: &str) -> bool {
        self.lock().contains_key(origin)
    }

    /// Cancels the exchange running for `origin`.  Returns false if none is.
    pub fn cancel(&self, origin: &str) -> bool {
        match self.lock().get(origin) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits until no exchange holds `origin`.
    pub async fn wait_released(&self, origin: &str) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.contains(origin) {
                return;
            }
            notified.await;
        }
    }
}

/// Releases its origin when dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    registry: &'a InFlightRegistry,
    origin: String,
}

impl InFlightGuard<'_> {
    /// The claimed origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.origin);
        self.registry.released.notify_waiters();
    }
}

struct Reply {
    text: String,
    continuation_token: Option<String>,
}

/// Runs chat exchanges against the collaborators.
pub struct ChatSessionEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    in_flight: InFlightRegistry,
    reload: ReloadScheduler,
    state: Mutex<ExchangeState>,
    cancel_root: Mutex<CancellationToken>,
}

impl ChatSessionEngine {
    /// Creates an engine.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let reload = ReloadScheduler::new(config.reload);
        Self {
            config,
            collaborators,
            in_flight: InFlightRegistry::new(),
            reload,
            state: Mutex::new(ExchangeState::Idle),
            cancel_root: Mutex::new(CancellationToken::new()),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State of the most recent exchange.
    pub fn state(&self) -> ExchangeState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ExchangeState::Idle)
    }

    /// Returns true if an exchange for `origin` is running.
    pub fn is_in_flight(&self, origin: &str) -> bool {
        self.in_flight.contains(origin)
    }

    /// Returns true if a post-completion reload has not fired yet.
    pub fn reload_pending(&self) -> bool {
        self.reload.is_pending()
    }

    /// Sends `text` and runs the exchange to its end.
    ///
    /// `Err` is returned only when no exchange was started: the message was
    /// blank, or an exchange for the origin is already running.  Every other
    /// failure is an [`ExchangeOutcome::Failed`] and has been shown to the
    /// user.
    pub async fn send(&self, text: &str) -> Result<ExchangeOutcome> {
        let cancel = self.root_token().child_token();
        self.send_with_cancel(text, cancel).await
    }

    /// Like [`send`](Self::send), but aborts when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome> {
        let message = text.trim();
        if message.is_empty() {
            EXCHANGES_REJECTED.click();
            return Err(Error::validation("message is empty"));
        }

        let cancel = cancel.child_token();
        let origin = self.collaborators.origin.resolve();
        let _guard = match &origin {
            Ok(origin) => match self.in_flight.try_acquire(&origin.key, cancel.clone()) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    EXCHANGES_REJECTED.click();
                    tracing::debug!(origin = %origin.key, "send rejected: exchange in flight");
                    return Err(err);
                }
            },
            Err(_) => None,
        };

        let span = tracing::info_span!(
            "exchange",
            origin = origin.as_ref().map(|o| o.key.as_str()).unwrap_or("<unresolved>")
        );
        Ok(self
            .run_exchange(origin, message.to_string(), cancel)
            .instrument(span)
            .await)
    }

    /// Cancels every exchange started through [`send`](Self::send).
    pub fn cancel_all(&self) {
        if let Ok(mut root) = self.cancel_root.lock() {
            root.cancel();
            *root = CancellationToken::new();
        }
    }

    /// Aborts the pending reload, if any.
    pub fn cancel_pending_reload(&self) -> bool {
        self.reload.cancel()
    }

    /// Clears the transcript and forgets the current origin's token.
    ///
    /// An exchange still running for the origin is cancelled first, and the
    /// clear waits for it to finish so that it cannot write a reply or a
    /// token afterwards.
    pub async fn clear_history(&self) -> Result<()> {
        let origin = self.collaborators.origin.resolve();
        if let Ok(origin) = &origin {
            if self.in_flight.cancel(&origin.key) {
                tracing::debug!(origin = %origin.key, "cancelling exchange before clear");
            }
            self.in_flight.wait_released(&origin.key).await;
        }

        self.reload.cancel();
        self.collaborators.transcript.clear();
        let origin = match origin {
            Ok(origin) => origin,
            Err(err) => {
                tracing::debug!("no origin to clear: {err}");
                return Ok(());
            }
        };
        self.bounded_store(self.collaborators.sessions.clear(&origin.key))
            .await
    }

    /// Reads the continuation state of the current origin.
    pub async fn session(&self) -> Result<ConversationSession> {
        let origin = self.collaborators.origin.resolve()?;
        let continuation_token = self
            .bounded_store(self.collaborators.sessions.get(&origin.key))
            .await?;
        Ok(ConversationSession {
            origin_key: origin.key,
            continuation_token,
        })
    }

    async fn run_exchange(
        &self,
        origin: Result<PageOrigin>,
        message: String,
        cancel: CancellationToken,
    ) -> ExchangeOutcome {
        EXCHANGES_STARTED.click();
        self.reload.cancel();
        self.collaborators
            .transcript
            .append_message(ChatMessage::user(message.clone()));
        self.set_state(ExchangeState::Sending);

        let started = Instant::now();
        let mut progress_shown = false;
        let result = self
            .stream_reply(origin.as_ref(), message, &cancel, &mut progress_shown)
            .await;
        STREAM_DURATION.add(started.elapsed().as_secs_f64());

        match (result, origin) {
            (Ok(reply), Ok(origin)) => self.complete(&origin.key, reply).await,
            (Ok(_), Err(err)) | (Err(err), _) => self.fail(err, progress_shown),
        }
    }

    async fn stream_reply(
        &self,
        origin: std::result::Result<&PageOrigin, &Error>,
        message: String,
        cancel: &CancellationToken,
        progress_shown: &mut bool,
    ) -> Result<Reply> {
        let credentials = self.collaborators.credentials.credentials();
        let (auth_token, api_key) = credentials.require()?;
        let origin = origin.map_err(|err| err.clone())?;

        let session_id = self
            .bounded_store(self.collaborators.sessions.get(&origin.key))
            .await?;
        let request = ChatRequest {
            message,
            auth_token: auth_token.to_string(),
            api_key: api_key.to_string(),
            api_url: origin.api_url.clone(),
            session_id,
            relay_credentials: credentials.relay_credentials.clone(),
            anthropic_key: credentials.anthropic_key().map(str::to_string),
        };
        tracing::debug!(has_session = request.session_id.is_some(), "sending chat request");

        let started = Instant::now();
        let opened = self.collaborators.transport.open(request);
        let body = cancellable(
            cancel,
            bounded(self.config.request_timeout, "initial response", opened),
        )
        .await?;
        STREAM_TTFB.add(started.elapsed().as_secs_f64());

        self.collaborators.progress.show_progress();
        *progress_shown = true;
        self.set_state(ExchangeState::Streaming);

        let lines = decoder::lines(body);
        futures::pin_mut!(lines);
        loop {
            let next = cancellable(
                cancel,
                bounded(self.config.idle_timeout, "next chunk", async {
                    Ok(lines.next().await)
                }),
            )
            .await?;
            let line = match next {
                Some(line) => line?,
                None => {
                    return Err(Error::stream_ended(
                        "stream closed before a result or error event",
                    ));
                }
            };
            match parse_line(&line)? {
                ParsedLine::Ignored => {}
                ParsedLine::Malformed { reason } => {
                    STREAM_MALFORMED_LINES.click();
                    tracing::warn!(%reason, line = %line, "skipping malformed stream line");
                }
                ParsedLine::Event(event) => {
                    STREAM_EVENTS.click();
                    match event {
                        ProtocolEvent::ProgressUpdate { text } => {
                            self.collaborators.progress.update_progress(&text);
                        }
                        ProtocolEvent::Result {
                            text,
                            continuation_token,
                        } => {
                            return Ok(Reply {
                                text,
                                continuation_token,
                            });
                        }
                        ProtocolEvent::Error { message } => {
                            return Err(Error::server_reported(message));
                        }
                    }
                }
            }
        }
    }

    async fn complete(&self, origin: &str, reply: Reply) -> ExchangeOutcome {
        let collaborators = &self.collaborators;
        collaborators.progress.hide_progress();
        collaborators
            .transcript
            .append_message(ChatMessage::assistant(reply.text.clone()));
        if let Some(token) = &reply.continuation_token {
            if let Err(err) = self
                .bounded_store(collaborators.sessions.set(origin, token))
                .await
            {
                tracing::warn!("failed to store continuation token: {err}");
            }
        }
        collaborators.notifications.request_completed(origin);
        self.reload.schedule(
            Arc::clone(&collaborators.transcript),
            Arc::clone(&collaborators.page),
        );

        EXCHANGES_COMPLETED.click();
        self.set_state(ExchangeState::Completed);
        tracing::info!("exchange completed");
        ExchangeOutcome::Completed(reply.text)
    }

    fn fail(&self, err: Error, progress_shown: bool) -> ExchangeOutcome {
        if progress_shown {
            self.collaborators.progress.hide_progress();
        }
        if err.is_cancelled() {
            EXCHANGES_CANCELLED.click();
            self.set_state(ExchangeState::Cancelled);
            tracing::info!("exchange cancelled");
            return ExchangeOutcome::Cancelled;
        }

        EXCHANGES_FAILED.click();
        self.collaborators
            .transcript
            .append_message(ChatMessage::assistant(err.user_message()));
        self.set_state(ExchangeState::Failed);
        tracing::warn!(kind = %err.kind(), "exchange failed: {err}");
        ExchangeOutcome::Failed(err.kind(), err.detail())
    }

    async fn bounded_store<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.store_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(match err {
                Error::Storage { .. } => err,
                other => Error::storage(other.to_string(), Some(Box::new(other))),
            }),
            Err(_) => Err(Error::storage(
                format!(
                    "session store did not answer within {:?}",
                    self.config.store_timeout
                ),
                None,
            )),
        }
    }

    fn set_state(&self, next: ExchangeState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn root_token(&self) -> CancellationToken {
        self.cancel_root
            .lock()
            .map(|root| root.clone())
            .unwrap_or_default()
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled("exchange cancelled by host")),
        value = fut => value,
    }
}

async fn bounded<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::network(format!("timed out after {limit:?} waiting for {what}"), None)
        })?,
    }
}
