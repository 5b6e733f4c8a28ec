use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_LOG_FILTER: &str = "runwire=info";

#[derive(Parser)]
#[command(name = "runwire")]
#[command(about = "runwire - streaming chat and agent run client", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/runwire/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List chats on the backend, latest first
    Sessions,
    /// Send a message and stream the reply
    Send {
        /// Chat id; a new chat is created when omitted
        #[arg(long)]
        chat: Option<String>,
        /// Attach an image URL
        #[arg(long)]
        image: Option<String>,
        /// Run a web search instead of a chat completion
        #[arg(long)]
        search: bool,
        message: String,
    },
    /// Replay a recorded hub log (one JSON frame per line) offline
    Replay {
        log: PathBuf,
        /// Run that progress frames without a run id belong to
        #[arg(long)]
        run: Option<String>,
        /// Attach replayed runs to this session and print its messages
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let settings = commands::load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Sessions => commands::sessions::list(settings).await?,
        Commands::Send {
            chat,
            image,
            search,
            message,
        } => {
            let options = commands::send::SendOptions {
                chat,
                image,
                search,
                message,
            };
            commands::send::run(settings, options).await?
        }
        Commands::Replay { log, run, session } => {
            let summary = commands::replay::replay_file(settings, &log, run.as_deref(), session.as_deref())?;
            print!("{summary}");
        }
    }

    Ok(())
}
