use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use notesync::{EventKind, SyncConfig};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "notesync",
    about = "Follow live note changes and stream AI edits from a notesync backend",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "NOTESYNC_WS_URL",
        help = "WebSocket address of the live channel"
    )]
    pub ws_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "NOTESYNC_API_URL",
        help = "Base URL of the notesync HTTP API"
    )]
    pub api_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "NOTESYNC_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the AI endpoint"
    )]
    pub token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "NOTESYNC_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "NOTESYNC_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print data events as JSON lines until Ctrl-C
    Listen {
        /// Join a note's room instead of the global room
        #[arg(long)]
        note_id: Option<String>,

        /// Only print these event kinds (repeatable)
        #[arg(long = "event", value_name = "KIND")]
        events: Vec<EventKind>,
    },

    /// Send one event on the live channel
    Send {
        /// Wire event type, e.g. note_update
        #[arg(long)]
        kind: EventKind,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long)]
        note_id: Option<String>,

        /// Seconds to wait for the channel to connect
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Stream an AI edit of a text to stdout
    Process {
        #[arg(long)]
        text: String,

        #[arg(long)]
        note_id: Option<String>,
    },
}

impl Cli {
    /// Environment config with command-line overrides applied.
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(ws_url) = &self.ws_url {
            config.ws_url = ws_url.clone();
        }
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        config
    }
}
