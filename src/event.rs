//! Protocol events carried on the chat stream.
//!
//! Each event occupies one line of the form
//!
//! ```text
//! data: {"type":"progress-update","data":"status text"}
//! data: {"type":"error","data":"message text"}
//! data: {"type":"result","data":"{\"text\":\"...\",\"session_id\":\"abc\"}"}
//! ```
//!
//! Lines without the `data: ` prefix are keep-alives or comments and carry
//! nothing.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Prefix that marks a line as carrying an event.
pub const DATA_PREFIX: &str = "data: ";

/// A typed event decoded from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Final reply; terminates the exchange.
    Result {
        /// Reply text, verbatim.
        text: String,
        /// Continuation token to use on the next exchange for this origin.
        continuation_token: Option<String>,
    },
    /// Server-side failure; terminates the exchange.
    Error {
        /// Server-provided message.
        message: String,
    },
    /// Interim status text; zero or more before the terminal event.
    ProgressUpdate {
        /// Status text to display.
        text: String,
    },
}

impl ProtocolEvent {
    /// Returns true for `Result` and `Error`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProtocolEvent::ProgressUpdate { .. })
    }
}

/// What one decoded line amounted to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedLine {
    /// Not an event line.
    Ignored,
    /// A well-formed event.
    Event(ProtocolEvent),
    /// An event line that could not be understood.  Non-fatal.
    Malformed {
        /// Why the line was rejected.
        reason: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ResultPayload {
    text: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// Decodes one line.
///
/// Envelope problems (bad JSON, unknown `type`) come back as
/// [`ParsedLine::Malformed`].  A `result` event whose payload cannot be
/// decoded is fatal and comes back as `Err` with kind
/// [`StreamTerminalParseFailure`](crate::ErrorKind::StreamTerminalParseFailure).
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    let Some(body) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(ParsedLine::Ignored);
    };
    if body.trim().is_empty() {
        return Ok(ParsedLine::Ignored);
    }

    let envelope = match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Ok(ParsedLine::Malformed {
                reason: format!("invalid envelope: {err}"),
            });
        }
    };

    let event = match envelope.event_type.as_str() {
        "result" => parse_result(envelope.data)?,
        "error" => ProtocolEvent::Error {
            message: data_text(envelope.data),
        },
        "progress-update" => ProtocolEvent::ProgressUpdate {
            text: data_text(envelope.data),
        },
        other => {
            return Ok(ParsedLine::Malformed {
                reason: format!("unknown event type: {other}"),
            });
        }
    };
    Ok(ParsedLine::Event(event))
}

fn parse_result(data: Value) -> Result<ProtocolEvent> {
    let payload = match data {
        Value::String(nested) => serde_json::from_str::<ResultPayload>(&nested),
        value @ Value::Object(_) => serde_json::from_value::<ResultPayload>(value),
        other => {
            return Err(Error::terminal_parse(
                format!("result payload must be a string or object, got {other}"),
                None,
            ));
        }
    }
    .map_err(|err| {
        Error::terminal_parse(
            format!("could not decode result payload: {err}"),
            Some(Box::new(err)),
        )
    })?;

    Ok(ProtocolEvent::Result {
        text: payload.text,
        continuation_token: payload.session_id.filter(|id| !id.is_empty()),
    })
}

fn data_text(data: Value) -> String {
    match data {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
