//! Conversation transcript.
//!
//! Messages keep their literal text so a transcript saved to disk loads back
//! exactly as it was written.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{from_reader, to_writer_pretty};

use crate::error::{Error, Result};

/// Message every fresh transcript opens with.
pub const GREETING: &str = "Hello! How can I help you today?";

/// Who wrote a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The person typing.
    User,
    /// The remote agent, or the engine speaking on its behalf.
    Assistant,
}

/// One message of the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Literal message text.
    pub text: String,
    /// Author of the message.
    pub sender: Sender,
}

impl ChatMessage {
    /// Creates a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::User,
        }
    }

    /// Creates an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Assistant,
        }
    }
}

/// Append-only view of the conversation owned by the UI.
pub trait TranscriptSink: Send + Sync {
    /// Appends one message.
    fn append_message(&self, message: ChatMessage);

    /// Returns every message in order.
    fn load_all(&self) -> Vec<ChatMessage>;

    /// Resets the conversation to its initial state.
    fn clear(&self);
}

/// In-memory transcript that starts with [`GREETING`].
#[derive(Debug)]
pub struct Transcript {
    messages: Mutex<Vec<ChatMessage>>,
}

impl Transcript {
    /// Creates a transcript holding only the greeting.
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(vec![ChatMessage::assistant(GREETING)]),
        }
    }

    /// Creates a transcript from previously saved messages.
    ///
    /// An empty history falls back to the greeting.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        if messages.is_empty() {
            Self::new()
        } else {
            Self {
                messages: Mutex::new(messages),
            }
        }
    }

    /// Number of messages, greeting included.
    pub fn len(&self) -> usize {
        self.load_all().len()
    }

    /// Returns true if the transcript holds no messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces every message with those of `other`.
    pub fn replace_with(&self, other: Transcript) {
        let incoming = other.load_all();
        if let Ok(mut messages) = self.messages.lock() {
            *messages = incoming;
        }
    }

    /// Saves the transcript to `path` as JSON.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let transcript = TranscriptFile::new(self.load_all());
        let file = File::create(path.as_ref())
            .map_err(|err| Error::io("failed to create transcript file", err))?;
        let writer = BufWriter::new(file);
        to_writer_pretty(writer, &transcript).map_err(|err| {
            Error::serialization("failed to serialize transcript", Some(Box::new(err)))
        })
    }

    /// Loads a transcript saved with [`Transcript::save_to`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|err| Error::io("failed to open transcript file", err))?;
        let reader = BufReader::new(file);
        let transcript: TranscriptFile = from_reader(reader).map_err(|err| {
            Error::serialization("failed to parse transcript", Some(Box::new(err)))
        })?;
        Ok(Self::from_messages(transcript.chat_history))
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptSink for Transcript {
    fn append_message(&self, message: ChatMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }

    fn load_all(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut messages) = self.messages.lock() {
            *messages = vec![ChatMessage::assistant(GREETING)];
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TranscriptFile {
    version: u8,
    #[serde(rename = "chatHistory")]
    chat_history: Vec<ChatMessage>,
}

impl TranscriptFile {
    fn new(chat_history: Vec<ChatMessage>) -> Self {
        Self {
            version: 1,
            chat_history,
        }
    }
}
