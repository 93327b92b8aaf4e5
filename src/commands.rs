use anyhow::{Context, Result, bail};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::config::Config;
use crate::error::ErrorKind;
use crate::events::{ChatStatus, MessageRole, OrchestratorUpdate, SendOutcome};
use crate::orchestrator::ChatOrchestrator;
use crate::session::ConversationSession;
use crate::storage::FileStore;
use crate::transport::HttpUnaryTransport;

/// Conversation session backed by the configured state file.
pub fn open_session(config: &Config) -> Result<ConversationSession> {
    let path = config.state_path()?;
    Ok(ConversationSession::open(Arc::new(FileStore::new(path))))
}

/// Ask one question and print the answer as it streams in.
pub async fn ask(config: &Config, question: &str) -> Result<()> {
    let mut orchestrator = ChatOrchestrator::from_config(config, open_session(config)?)?;
    let mut renderer = Renderer::new(orchestrator.subscribe());

    run_turn(&mut orchestrator, &mut renderer, TurnAction::Send(question)).await?;
    orchestrator.shutdown();

    match orchestrator.last_error() {
        Some(err) if err.kind() != ErrorKind::MalformedResponse => bail!("{err}"),
        _ => Ok(()),
    }
}

/// Interactive loop. `/retry`, `/reset`, `/quit`; `/N` asks suggestion N.
pub async fn chat(config: &Config) -> Result<()> {
    let mut orchestrator = ChatOrchestrator::from_config(config, open_session(config)?)?;
    let mut renderer = Renderer::new(orchestrator.subscribe());

    println!("🎓 Tutor chat");
    println!("{}", "=".repeat(50));
    if !config.major.is_empty() {
        println!("📚 Major: {} {}", config.major, config.sub_field);
    }
    println!("💡 /retry, /reset, /quit. Ctrl-C stops an answer.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("💬 > ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read user input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                orchestrator.reset();
                renderer.drain();
            }
            "/retry" => run_turn(&mut orchestrator, &mut renderer, TurnAction::Retry).await?,
            _ => {
                let question = match pick_suggestion(&orchestrator, input) {
                    Some(suggestion) => {
                        println!("❓ {suggestion}");
                        suggestion
                    }
                    None => input.to_string(),
                };
                run_turn(&mut orchestrator, &mut renderer, TurnAction::Send(&question)).await?;
            }
        }
    }

    orchestrator.shutdown();
    println!("👋 Bye!");
    Ok(())
}

/// Probe the service.
pub async fn health(config: &Config) -> Result<()> {
    let base_url = config.base_url()?;
    let transport = HttpUnaryTransport::new(base_url.clone(), config.request_timeout())?;
    match transport.health().await {
        Ok(body) => {
            println!("✅ {base_url} is up");
            if !body.is_empty() {
                println!("   {body}");
            }
            Ok(())
        }
        Err(err) => bail!("{base_url} is not reachable: {err}"),
    }
}

/// Forget the stored conversation and start a new one.
pub fn reset(config: &Config) -> Result<()> {
    let mut session = open_session(config)?;
    let previous = session.peek().cloned();
    let id = session.rotate();

    match previous {
        Some(previous) => println!("🧹 Replaced conversation {previous} with {id}"),
        None => println!("🧹 Started conversation {id}"),
    }
    println!("📍 Saved to {}", config.state_path()?.display());
    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config: &Config) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    println!("{}", content.trim_end());
    println!();
    println!("# state file: {}", config.state_path()?.display());
    Ok(())
}

enum TurnAction<'a> {
    Send(&'a str),
    Retry,
}

/// Start a turn and render it until it settles. Ctrl-C cancels the answer.
async fn run_turn(
    orchestrator: &mut ChatOrchestrator,
    renderer: &mut Renderer,
    action: TurnAction<'_>,
) -> Result<()> {
    let outcome = match action {
        TurnAction::Send(question) => orchestrator.send(question),
        TurnAction::Retry => orchestrator.retry(),
    };
    match outcome {
        Ok(SendOutcome::Started(_)) => {}
        Ok(SendOutcome::Ignored) => {
            println!("⏳ Still answering the previous question.");
            return Ok(());
        }
        Err(err) => {
            println!("❌ {}", err.user_message());
            return Ok(());
        }
    }
    renderer.drain();

    loop {
        tokio::select! {
            more = orchestrator.next_event() => {
                renderer.drain();
                if !more {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // Past the answer only suggestions are pending; drop them.
                if !orchestrator.cancel() {
                    orchestrator.shutdown();
                }
                renderer.drain();
                break;
            }
        }
    }
    io::stdout().flush()?;
    Ok(())
}

fn pick_suggestion(orchestrator: &ChatOrchestrator, input: &str) -> Option<String> {
    let index: usize = input.strip_prefix('/')?.parse().ok()?;
    orchestrator
        .messages()
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .and_then(|m| m.suggestions.get(index.checked_sub(1)?))
        .cloned()
}

/// Prints orchestrator updates to the terminal.
struct Renderer {
    updates: broadcast::Receiver<OrchestratorUpdate>,
    line_open: bool,
}

impl Renderer {
    fn new(updates: broadcast::Receiver<OrchestratorUpdate>) -> Self {
        Self {
            updates,
            line_open: false,
        }
    }

    fn drain(&mut self) {
        loop {
            match self.updates.try_recv() {
                Ok(update) => self.render(update),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Renderer skipped {skipped} updates");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        let _ = io::stdout().flush();
    }

    fn render(&mut self, update: OrchestratorUpdate) {
        match update {
            OrchestratorUpdate::MessageAppended(message) if message.role == MessageRole::Assistant => {
                print!("🤖 ");
                self.line_open = true;
            }
            OrchestratorUpdate::TextAppended { delta, .. } => print!("{delta}"),
            OrchestratorUpdate::TextReplaced { text, .. } => print!("{text}"),
            OrchestratorUpdate::StatusChanged(status) => {
                if matches!(status, ChatStatus::AwaitingSuggestions | ChatStatus::Idle) {
                    self.close_line();
                }
            }
            OrchestratorUpdate::MessageRemoved(_) => self.close_line(),
            OrchestratorUpdate::SuggestionsAttached { suggestions, .. } => {
                self.close_line();
                println!();
                println!("💡 You could also ask:");
                for (i, suggestion) in suggestions.iter().enumerate() {
                    println!("   /{} {}", i + 1, suggestion);
                }
            }
            OrchestratorUpdate::TurnFailed { error, .. } => {
                self.close_line();
                println!("❌ {}", error.user_message());
                if error.is_retryable() {
                    println!("   Type /retry to ask again.");
                }
            }
            OrchestratorUpdate::TurnCancelled { .. } => {
                self.close_line();
                println!("⏹️  Stopped.");
            }
            OrchestratorUpdate::ConversationRotated(id) => {
                println!("🧹 New conversation {id}");
            }
            OrchestratorUpdate::MessageAppended(_)
            | OrchestratorUpdate::ConversationAdopted(_)
            | OrchestratorUpdate::HistoryCleared => {}
        }
    }

    fn close_line(&mut self) {
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}
