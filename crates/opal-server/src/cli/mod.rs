// crates/opal-server/src/cli/mod.rs
// Command-line surface for the opal binary

pub mod config;
pub mod serve;
pub mod tool;

use clap::{Parser, Subcommand};

/// Exit codes: 0 normal, 2 bad flag (clap), 3 config error, 4 fatal init.
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_INIT: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "opal", version, about = "Developer-workflow automation server (MCP)")]
pub struct Cli {
    /// Persona to activate at startup
    #[arg(long = "agent", global = true)]
    pub agent: Option<String>,

    /// Comma-separated list of modules to load at startup
    #[arg(long = "tools", global = true)]
    pub tools: Option<String>,

    /// Load every module in the catalog
    #[arg(long, global = true)]
    pub all: bool,

    /// Disable the cron scheduler
    #[arg(long = "no-scheduler", global = true)]
    pub no_scheduler: bool,

    /// Port for the loopback WebSocket execution bus
    #[arg(long = "ws-port", global = true)]
    pub ws_port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the MCP server on stdio (the default)
    Serve,
    /// Invoke one tool and print its result (operator escape hatch)
    Tool {
        /// Tool name
        name: String,
        /// Tool arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective config file
    Show,
    /// Set a dotted key in config.toml (e.g. persona.default_persona)
    Set { key: String, value: String },
}

/// Startup failures mapped onto exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(String),
    #[error("init error: {0}")]
    Init(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => EXIT_CONFIG,
            StartupError::Init(_) => EXIT_INIT,
        }
    }
}
