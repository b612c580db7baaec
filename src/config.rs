//! Engine configuration.
//!
//! [`EngineConfig`] holds the resolved settings for a
//! [`ChatSessionEngine`](crate::ChatSessionEngine); [`ChatArgs`] parses the
//! command line of the terminal client via `arrrg` and also carries the
//! client-only settings (files, color) that the engine never sees.

use std::path::PathBuf;
use std::time::Duration;

use arrrg_derive::CommandLine;

use crate::reload::ReloadPolicy;

/// Default chat service.
pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:8000";

/// Default bound on each session store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments for the relaychat-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Base URL of the chat service.
    #[arrrg(optional, "Chat service base URL (default: http://127.0.0.1:8000)", "URL")]
    pub service_url: Option<String>,

    /// URL of the page the conversation is about.
    #[arrrg(optional, "URL of the page the conversation is scoped to", "URL")]
    pub page_url: Option<String>,

    /// File holding continuation tokens across runs.
    #[arrrg(optional, "Session token file (default: in-memory)", "PATH")]
    pub session_file: Option<String>,

    /// File holding the transcript across runs.
    #[arrrg(optional, "Transcript file to load and auto-save", "PATH")]
    pub transcript: Option<String>,

    /// Idle timeout between stream chunks, in seconds.
    #[arrrg(optional, "Seconds to wait for each stream chunk (default: unbounded)", "SECS")]
    pub idle_timeout: Option<u64>,

    /// Do not reload after a completed reply.
    #[arrrg(flag, "Disable the reload after each completed reply")]
    pub no_reload: bool,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

impl ChatArgs {
    /// File holding continuation tokens, if one was given.
    pub fn session_file_path(&self) -> Option<PathBuf> {
        self.session_file.as_ref().map(PathBuf::from)
    }

    /// File the transcript is loaded from and auto-saved to, if one was given.
    pub fn transcript_path(&self) -> Option<PathBuf> {
        self.transcript.as_ref().map(PathBuf::from)
    }

    /// Whether to use ANSI colors and styles in output.
    pub fn use_color(&self) -> bool {
        !self.no_color
    }
}

/// Resolved settings for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Base URL of the chat service; requests go to `{service_url}/chat`.
    pub service_url: String,

    /// Bound on waiting for the initial response.  `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Bound on waiting for each subsequent chunk.  `None` waits forever.
    pub idle_timeout: Option<Duration>,

    /// Bound on each session store call.
    pub store_timeout: Duration,

    /// What to do after a completed reply.
    pub reload: ReloadPolicy,
}

impl EngineConfig {
    /// Creates a new EngineConfig with default values.
    ///
    /// Defaults:
    /// - Service URL: http://127.0.0.1:8000
    /// - Request and idle timeouts: none
    /// - Store timeout: 5 seconds
    /// - Reload: staged, 1 s then 2 s
    pub fn new() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            request_timeout: None,
            idle_timeout: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            reload: ReloadPolicy::default(),
        }
    }

    /// Sets the service URL.
    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = url.into();
        self
    }

    /// Sets the initial response timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the per-chunk idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the store call timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the reload policy.
    pub fn with_reload(mut self, reload: ReloadPolicy) -> Self {
        self.reload = reload;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&ChatArgs> for EngineConfig {
    fn from(args: &ChatArgs) -> Self {
        EngineConfig {
            service_url: args
                .service_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
            idle_timeout: args.idle_timeout.map(Duration::from_secs),
            reload: if args.no_reload {
                ReloadPolicy::Disabled
            } else {
                ReloadPolicy::default()
            },
            ..EngineConfig::new()
        }
    }
}
