//! UI-side collaborators of the engine.
//!
//! The engine never draws anything itself.  It calls into a [`ProgressSink`],
//! a [`NotificationSink`] and a [`PageController`], alongside the
//! [`TranscriptSink`].  [`ConsoleWidget`] implements all four for a terminal.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::transcript::{ChatMessage, Sender, Transcript, TranscriptSink};

/// Text shown by the progress indicator before the server says anything.
pub const DEFAULT_PROGRESS_TEXT: &str = "Answering your request might take a while...";

/// ANSI escape code for dim text (used for progress).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the assistant label).
const ANSI_CYAN: &str = "\x1b[36m";

/// Loading indicator shown while a reply streams in.
pub trait ProgressSink: Send + Sync {
    /// Shows the indicator with [`DEFAULT_PROGRESS_TEXT`].
    fn show_progress(&self);

    /// Replaces the indicator text.
    fn update_progress(&self, text: &str);

    /// Removes the indicator.  Hiding an absent indicator is a no-op.
    fn hide_progress(&self);
}

/// Fire-and-forget signal that a billable request completed.
pub trait NotificationSink: Send + Sync {
    /// Called once per completed exchange.
    fn request_completed(&self, origin: &str);
}

/// Controls the page hosting the conversation.
pub trait PageController: Send + Sync {
    /// Reloads the hosting page.
    fn reload(&self);
}

/// Collaborator that does nothing; useful when a host has no such concept.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWidget;

impl ProgressSink for NoopWidget {
    fn show_progress(&self) {}

    fn update_progress(&self, _: &str) {}

    fn hide_progress(&self) {}
}

impl NotificationSink for NoopWidget {
    fn request_completed(&self, _: &str) {}
}

impl PageController for NoopWidget {
    fn reload(&self) {}
}

#[derive(Debug, Default)]
struct ConsoleState {
    progress: Option<String>,
    completed_requests: u64,
    reloads: u64,
}

/// Plain-text widget for terminals, with optional ANSI styling.
///
/// Messages are kept in an inner [`Transcript`] and echoed to stdout as they
/// arrive.  A "reload" redraws the whole transcript.
#[derive(Debug)]
pub struct ConsoleWidget {
    transcript: Transcript,
    use_color: bool,
    state: Mutex<ConsoleState>,
}

impl ConsoleWidget {
    /// Creates a widget with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a widget with the specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self::with_transcript(Transcript::new(), use_color)
    }

    /// Creates a widget showing a previously loaded transcript.
    pub fn with_transcript(transcript: Transcript, use_color: bool) -> Self {
        Self {
            transcript,
            use_color,
            state: Mutex::new(ConsoleState::default()),
        }
    }

    /// The underlying transcript.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Current progress text, if the indicator is shown.
    pub fn progress(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.progress.clone())
    }

    /// Number of completion notifications received.
    pub fn completed_requests(&self) -> u64 {
        self.state.lock().map(|s| s.completed_requests).unwrap_or(0)
    }

    /// Number of page reloads performed.
    pub fn reloads(&self) -> u64 {
        self.state.lock().map(|s| s.reloads).unwrap_or(0)
    }

    /// Prints every message of the transcript.
    pub fn redraw(&self) {
        for message in self.transcript.load_all() {
            self.print_message(&message);
        }
    }

    fn print_message(&self, message: &ChatMessage) {
        let mut stdout = io::stdout().lock();
        let label = match message.sender {
            Sender::User => "You",
            Sender::Assistant => "Assistant",
        };
        let _ = if self.use_color && message.sender == Sender::Assistant {
            writeln!(stdout, "{ANSI_CYAN}{label}:{ANSI_RESET} {}", message.text)
        } else {
            writeln!(stdout, "{label}: {}", message.text)
        };
        let _ = stdout.flush();
    }

    fn print_progress(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = if self.use_color {
            writeln!(stdout, "{ANSI_DIM}… {text}{ANSI_RESET}")
        } else {
            writeln!(stdout, "… {text}")
        };
        let _ = stdout.flush();
    }
}

impl Default for ConsoleWidget {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptSink for ConsoleWidget {
    fn append_message(&self, message: ChatMessage) {
        // The prompt line already shows what the user typed.
        if message.sender == Sender::Assistant {
            self.print_message(&message);
        }
        self.transcript.append_message(message);
    }

    fn load_all(&self) -> Vec<ChatMessage> {
        self.transcript.load_all()
    }

    fn clear(&self) {
        self.transcript.clear();
    }
}

impl ProgressSink for ConsoleWidget {
    fn show_progress(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.progress = Some(DEFAULT_PROGRESS_TEXT.to_string());
        }
        self.print_progress(DEFAULT_PROGRESS_TEXT);
    }

    fn update_progress(&self, text: &str) {
        let shown = match self.state.lock() {
            Ok(mut state) if state.progress.is_some() => {
                state.progress = Some(text.to_string());
                true
            }
            _ => false,
        };
        if shown {
            self.print_progress(text);
        }
    }

    fn hide_progress(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.progress = None;
        }
    }
}

impl NotificationSink for ConsoleWidget {
    fn request_completed(&self, origin: &str) {
        tracing::debug!(origin, "request completed");
        if let Ok(mut state) = self.state.lock() {
            state.completed_requests += 1;
        }
    }
}

impl PageController for ConsoleWidget {
    fn reload(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.reloads += 1;
        }
        println!();
        self.redraw();
    }
}
