//! Interactive terminal client for a page-scoped chat service.
//!
//! Each line typed at the prompt is sent to the chat service together with
//! the page URL the conversation is about.  Replies stream back as
//! line-delimited events; progress is shown while the agent works.
//!
//! # Usage
//!
//! ```bash
//! export RELAYCHAT_AUTH_TOKEN=...
//! export RELAYCHAT_API_KEY=...
//!
//! relaychat-chat --page-url https://app.example.com/workflows/42
//!
//! # Keep sessions and the transcript across runs
//! relaychat-chat --page-url https://app.example.com/ \
//!     --session-file sessions.json --transcript chat.json
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`.

use std::path::Path;
use std::sync::Arc;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use relaychat::{
    ChatArgs, ChatCommand, ChatSessionEngine, Collaborators, ConsoleWidget, Credentials,
    EngineConfig, ExchangeOutcome, FileSessionStore, HttpTransport, MemorySessionStore,
    SessionStore, StaticCredentials, Transcript, UrlOriginResolver, help_text, parse_command,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaychat=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("relaychat-chat [OPTIONS]");
    let config = EngineConfig::from(&args);
    let page_url = args.page_url.clone().unwrap_or_default();
    let transcript_path = args.transcript_path();

    let transcript = match &transcript_path {
        Some(path) if path.exists() => Transcript::load_from(path)?,
        _ => Transcript::new(),
    };
    let widget = Arc::new(ConsoleWidget::with_transcript(transcript, args.use_color()));
    let sessions: Arc<dyn SessionStore> = match args.session_file_path() {
        Some(path) => Arc::new(FileSessionStore::new(path)),
        None => Arc::new(MemorySessionStore::new()),
    };
    let collaborators = Collaborators {
        credentials: Arc::new(StaticCredentials::new(Credentials::from_env())),
        origin: Arc::new(UrlOriginResolver::new(page_url.clone())),
        transport: Arc::new(HttpTransport::new(&config.service_url, None)?),
        sessions,
        transcript: widget.clone(),
        progress: widget.clone(),
        notifications: widget.clone(),
        page: widget.clone(),
    };
    let engine = Arc::new(ChatSessionEngine::new(config, collaborators));

    // Ctrl+C while a reply streams cancels it; at the prompt rustyline sees it first.
    let handler_engine = Arc::clone(&engine);
    ctrlc::set_handler(move || {
        handler_engine.cancel_all();
    })?;

    let mut rl = DefaultEditor::new()?;
    println!("Relay Chat (service: {})", engine.config().service_url);
    if page_url.is_empty() {
        println!("No --page-url given; requests will fail until one is set.");
    }
    println!("Type /help for commands, /quit to exit\n");
    widget.redraw();

    loop {
        match rl.readline("You: ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                        }
                        ChatCommand::Clear => match engine.clear_history().await {
                            Ok(()) => println!("    Conversation cleared."),
                            Err(err) => eprintln!("    Failed to clear session: {}", err),
                        },
                        ChatCommand::Session => match engine.session().await {
                            Ok(session) => {
                                println!("    Origin: {}", session.origin_key);
                                println!(
                                    "    Session: {}",
                                    session.continuation_token.as_deref().unwrap_or("(none)")
                                );
                            }
                            Err(err) => eprintln!("    {}", err),
                        },
                        ChatCommand::Stay => {
                            if engine.cancel_pending_reload() {
                                println!("    Reload cancelled.");
                            } else {
                                println!("    No reload pending.");
                            }
                        }
                        ChatCommand::SaveTranscript(path) => {
                            match widget.transcript().save_to(&path) {
                                Ok(()) => println!("    Transcript saved to {}", path),
                                Err(err) => eprintln!("    Failed to save transcript: {}", err),
                            }
                        }
                        ChatCommand::LoadTranscript(path) => match Transcript::load_from(&path) {
                            Ok(loaded) => {
                                widget.transcript().replace_with(loaded);
                                println!("    Transcript loaded from {}", path);
                                widget.redraw();
                            }
                            Err(err) => eprintln!("    Failed to load transcript: {}", err),
                        },
                        ChatCommand::Invalid(message) => eprintln!("    {}", message),
                    }
                    continue;
                }

                match engine.send(line).await {
                    Ok(ExchangeOutcome::Cancelled) => println!("    [interrupted]"),
                    Ok(ExchangeOutcome::Completed(_) | ExchangeOutcome::Failed(..)) => {}
                    Err(err) => eprintln!("    {}", err),
                }
                if let Some(path) = transcript_path.as_deref() {
                    autosave(&widget, path);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Input error: {}", err);
                break;
            }
        }
    }

    if let Some(path) = transcript_path.as_deref() {
        autosave(&widget, path);
    }
    Ok(())
}

fn autosave(widget: &ConsoleWidget, path: &Path) {
    if let Err(err) = widget.transcript().save_to(path) {
        tracing::warn!(path = %path.display(), "failed to auto-save transcript: {err}");
    }
}
