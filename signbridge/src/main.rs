mod commands;
mod tracing_helper;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use signbridge_lib::config::Config;

#[derive(Parser)]
#[command(version, about = "Peer-to-peer call negotiation over a shared signaling store")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = "signbridge.toml")]
    config: PathBuf,
    /// Also write warnings and errors to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect two sessions to each other inside this process.
    Loopback {
        #[arg(long, default_value_t = 30)]
        timeout_sec: u64,
    },
    /// Place a call through the file store and keep it up until Ctrl-C.
    Call {
        #[arg(long)]
        from: String,
        #[arg(long)]
        from_name: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        to_name: String,
    },
    /// Wait for a call to the given user and accept it.
    Answer {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_helper::init_tracing(cli.log_file.as_deref())?;
    let config = Config::load(&cli.config).await?;

    match cli.command {
        Command::Loopback { timeout_sec } => commands::loopback(&config, timeout_sec).await,
        Command::Call {
            from,
            from_name,
            to,
            to_name,
        } => commands::call(&config, (from, from_name), (to, to_name)).await,
        Command::Answer { user } => commands::answer(&config, &user).await,
    }
}
