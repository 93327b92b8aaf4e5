use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tutor_chat::commands;
use tutor_chat::config::Config;

#[derive(Parser)]
#[command(name = "tutor-chat")]
#[command(version)]
#[command(about = "Chat with a major-aware AI tutor from the terminal", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.tutor-chat/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the service base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and stream the answer
    Ask {
        question: String,
        #[arg(long)]
        major: Option<String>,
        #[arg(long)]
        sub_field: Option<String>,
        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// Interactive chat (default)
    Chat,
    /// Check that the service is reachable
    Health,
    /// Start a new conversation
    Reset,
    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they never interleave with streamed answers.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        None | Some(Commands::Chat) => commands::chat(&config).await,
        Some(Commands::Ask {
            question,
            major,
            sub_field,
            no_stream,
        }) => {
            if let Some(major) = major {
                config.major = major;
            }
            if let Some(sub_field) = sub_field {
                config.sub_field = sub_field;
            }
            if no_stream {
                config.streaming = false;
            }
            commands::ask(&config, &question).await
        }
        Some(Commands::Health) => commands::health(&config).await,
        Some(Commands::Reset) => commands::reset(&config),
        Some(Commands::Config) => commands::show_config(&config),
    }
}
