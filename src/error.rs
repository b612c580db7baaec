//! Error types for relaychat.
//!
//! Every failure the engine can hit is an [`Error`].  Fatal exchange failures
//! map onto the closed [`ErrorKind`] taxonomy, which decides the prefix of the
//! single message shown to the user when an exchange fails.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Closed classification of exchange failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No auth token was available.
    MissingCredential,
    /// No API key was configured.
    MissingConfig,
    /// The request target could not be derived from the page.
    OriginResolutionFailure,
    /// The initial response carried a non-success status.
    HttpError,
    /// The transport failed (unreachable, reset, timed out).
    NetworkError,
    /// The terminal `result` payload could not be decoded.
    StreamTerminalParseFailure,
    /// The server sent an explicit `error` event.
    ServerReportedError,
    /// The stream closed without a `result` or `error` event.
    StreamEndedWithoutTerminal,
    /// The session store failed or did not answer in time.
    StorageFailure,
    /// The message was empty after trimming.
    EmptyMessage,
    /// Another exchange for the same origin is still running.
    ExchangeInFlight,
    /// The exchange was aborted by the host.
    Cancelled,
    /// Anything that does not fit the categories above.
    Internal,
}

impl ErrorKind {
    /// Returns true if a failure of this kind is shown to the user.
    ///
    /// Rejections that never started an exchange, and cancellations, are
    /// reported to the caller only.
    pub fn is_user_visible(self) -> bool {
        !matches!(
            self,
            ErrorKind::EmptyMessage | ErrorKind::ExchangeInFlight | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::MissingConfig => "missing_config",
            ErrorKind::OriginResolutionFailure => "origin_resolution_failure",
            ErrorKind::HttpError => "http_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::StreamTerminalParseFailure => "stream_terminal_parse_failure",
            ErrorKind::ServerReportedError => "server_reported_error",
            ErrorKind::StreamEndedWithoutTerminal => "stream_ended_without_terminal",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::EmptyMessage => "empty_message",
            ErrorKind::ExchangeInFlight => "exchange_in_flight",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// The main error type for relaychat.
#[derive(Clone, Debug)]
pub enum Error {
    /// The auth token is absent.
    MissingCredential {
        /// Human-readable error message.
        message: String,
    },

    /// The API key is absent.
    MissingConfig {
        /// Human-readable error message.
        message: String,
    },

    /// The page origin could not be resolved.
    OriginResolution {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// The chat endpoint answered with a non-success status.
    Http {
        /// HTTP status code.
        status_code: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// Connection-level failure.
    Network {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The terminal `result` event carried an undecodable payload.
    TerminalParse {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The server reported an error event.
    ServerReported {
        /// Message provided by the server.
        message: String,
    },

    /// The stream closed without a terminal event.
    StreamEnded {
        /// Human-readable error message.
        message: String,
    },

    /// The session store failed.
    Storage {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Error during validation of input.
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// An exchange for the origin is already in flight.
    InFlight {
        /// Origin that is busy.
        origin: String,
    },

    /// The exchange was cancelled.
    Cancelled {
        /// Human-readable error message.
        message: String,
    },

    /// Error during JSON serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },
}

impl Error {
    /// Creates a new missing-credential error.
    pub fn missing_credential(message: impl Into<String>) -> Self {
        Error::MissingCredential {
            message: message.into(),
        }
    }

    /// Creates a new missing-config error.
    pub fn missing_config(message: impl Into<String>) -> Self {
        Error::MissingConfig {
            message: message.into(),
        }
    }

    /// Creates a new origin resolution error.
    pub fn origin_resolution(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::OriginResolution {
            message: message.into(),
            source,
        }
    }

    /// Creates a new HTTP status error carrying the body verbatim.
    pub fn http(status_code: u16, body: impl Into<String>) -> Self {
        Error::Http {
            status_code,
            body: body.into(),
        }
    }

    /// Creates a new network error.
    pub fn network(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Network {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new terminal payload parse error.
    pub fn terminal_parse(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::TerminalParse {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new server-reported error.
    pub fn server_reported(message: impl Into<String>) -> Self {
        Error::ServerReported {
            message: message.into(),
        }
    }

    /// Creates a new stream-ended-without-terminal error.
    pub fn stream_ended(message: impl Into<String>) -> Self {
        Error::StreamEnded {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    pub fn storage(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Storage {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Creates a new in-flight rejection.
    pub fn in_flight(origin: impl Into<String>) -> Self {
        Error::InFlight {
            origin: origin.into(),
        }
    }

    /// Creates a new cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingCredential { .. } => ErrorKind::MissingCredential,
            Error::MissingConfig { .. } => ErrorKind::MissingConfig,
            Error::OriginResolution { .. } => ErrorKind::OriginResolutionFailure,
            Error::Http { .. } => ErrorKind::HttpError,
            Error::Network { .. } => ErrorKind::NetworkError,
            Error::TerminalParse { .. } => ErrorKind::StreamTerminalParseFailure,
            Error::ServerReported { .. } => ErrorKind::ServerReportedError,
            Error::StreamEnded { .. } => ErrorKind::StreamEndedWithoutTerminal,
            Error::Storage { .. } => ErrorKind::StorageFailure,
            Error::Validation { .. } => ErrorKind::EmptyMessage,
            Error::InFlight { .. } => ErrorKind::ExchangeInFlight,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Serialization { .. } | Error::Io { .. } => ErrorKind::Internal,
        }
    }

    /// Human-readable detail without the classified prefix.
    pub fn detail(&self) -> String {
        match self {
            Error::MissingCredential { message }
            | Error::MissingConfig { message }
            | Error::OriginResolution { message, .. }
            | Error::Network { message, .. }
            | Error::TerminalParse { message, .. }
            | Error::ServerReported { message }
            | Error::StreamEnded { message }
            | Error::Storage { message, .. }
            | Error::Validation { message }
            | Error::Cancelled { message }
            | Error::Serialization { message, .. }
            | Error::Io { message, .. } => message.clone(),
            Error::Http { body, .. } => body.clone(),
            Error::InFlight { origin } => format!("an exchange for {origin} is already running"),
        }
    }

    /// The single message appended to the transcript when an exchange fails.
    ///
    /// Precondition and network failures use fixed wording; the server's
    /// text is shown verbatim for HTTP and error-event failures.
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingCredential { .. } => {
                "Error: Please sign in before chatting.".to_string()
            }
            Error::MissingConfig { .. } => {
                "Error: API key not configured. Please configure it before chatting.".to_string()
            }
            Error::OriginResolution { .. } => {
                "Error: Could not determine API URL from current page.".to_string()
            }
            Error::Http { body, .. } => format!("Server Error: {body}"),
            Error::Network { .. } => {
                "Network Error: Unable to reach server. Please check your connection.".to_string()
            }
            Error::StreamEnded { .. } => {
                "Error: The server closed the stream without a reply.".to_string()
            }
            _ => format!("Error: {}", self.detail()),
        }
    }

    /// Returns true if this error was raised before any network call.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::MissingCredential { .. }
                | Error::MissingConfig { .. }
                | Error::OriginResolution { .. }
        )
    }

    /// Returns true if this error is a network error.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }

    /// Returns true if this error is an HTTP status error.
    pub fn is_http(&self) -> bool {
        matches!(self, Error::Http { .. })
    }

    /// Returns true if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Http { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

/// Maps a reqwest failure onto the taxonomy.
///
/// Every transport-level failure is a [`ErrorKind::NetworkError`]; only the
/// wording of the diagnostic differs.
pub fn classify_transport(err: reqwest::Error) -> Error {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("could not connect: {err}")
    } else if err.is_body() || err.is_decode() {
        format!("response body failed: {err}")
    } else {
        format!("request failed: {err}")
    };
    Error::network(message, Some(Box::new(err)))
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingCredential { message } => write!(f, "Missing credential: {message}"),
            Error::MissingConfig { message } => write!(f, "Missing configuration: {message}"),
            Error::OriginResolution { message, .. } => {
                write!(f, "Origin resolution error: {message}")
            }
            Error::Http { status_code, body } => write!(f, "HTTP error {status_code}: {body}"),
            Error::Network { message, .. } => write!(f, "Network error: {message}"),
            Error::TerminalParse { message, .. } => {
                write!(f, "Terminal event parse error: {message}")
            }
            Error::ServerReported { message } => write!(f, "Server error: {message}"),
            Error::StreamEnded { message } => write!(f, "Stream ended: {message}"),
            Error::Storage { message, .. } => write!(f, "Storage error: {message}"),
            Error::Validation { message } => write!(f, "Validation error: {message}"),
            Error::InFlight { origin } => {
                write!(f, "Exchange already in flight for origin {origin}")
            }
            Error::Cancelled { message } => write!(f, "Cancelled: {message}"),
            Error::Serialization { message, .. } => write!(f, "Serialization error: {message}"),
            Error::Io { message, .. } => write!(f, "I/O error: {message}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::OriginResolution { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            Error::Network { source, .. }
            | Error::TerminalParse { source, .. }
            | Error::Storage { source, .. }
            | Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::origin_resolution(format!("URL parse error: {err}"), Some(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        classify_transport(err)
    }
}

/// A specialized Result type for relaychat operations.
pub type Result<T> = std::result::Result<T, Error>;
