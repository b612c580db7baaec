//! Streaming chat session engine.
//!
//! `relaychat` sends a user's message to a remote agent service, decodes the
//! line-oriented event stream that comes back, and drives the UI through a
//! small set of collaborator traits.  See [`ChatSessionEngine`] for the
//! exchange lifecycle.

// Public modules
pub mod commands;
pub mod config;
pub mod context;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod event;
pub mod reload;
pub mod session_store;
pub mod transcript;
pub mod transport;
pub mod widget;

mod observability;

// Re-exports
pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, EngineConfig};
pub use context::{
    CredentialProvider, Credentials, OriginResolver, PageOrigin, StaticCredentials,
    UrlOriginResolver,
};
pub use decoder::LineDecoder;
pub use engine::{
    ChatSessionEngine, Collaborators, ConversationSession, ExchangeOutcome, ExchangeState,
    InFlightGuard, InFlightRegistry,
};
pub use error::{Error, ErrorKind, Result, classify_transport};
pub use event::{DATA_PREFIX, ParsedLine, ProtocolEvent, parse_line};
pub use observability::register_biometrics;
pub use reload::{RELOAD_ANNOUNCEMENT, ReloadPolicy, ReloadScheduler};
pub use session_store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use transcript::{ChatMessage, GREETING, Sender, Transcript, TranscriptSink};
pub use transport::{ByteStream, ChatRequest, HttpTransport, Transport};
pub use widget::{
    ConsoleWidget, DEFAULT_PROGRESS_TEXT, NoopWidget, NotificationSink, PageController,
    ProgressSink,
};
