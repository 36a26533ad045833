mod channel;
mod cli;
mod logging;
mod process;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing so `.env` values reach clap's env fallbacks.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let config = cli.sync_config();

    match cli.command {
        Command::Listen { note_id, events } => channel::listen(config, note_id, events).await,
        Command::Send {
            kind,
            payload,
            note_id,
            wait,
        } => channel::send(config, note_id, kind, &payload, Duration::from_secs(wait)).await,
        Command::Process { text, note_id } => {
            process::process(config, &text, note_id.as_deref()).await
        }
    }
}
