// crates/opal-server/src/main.rs
// Opal - developer-workflow automation server

mod cli;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands, ConfigAction};

#[tokio::main]
async fn main() {
    // Load .env from the config root only (never from CWD - a malicious repo
    // could override settings)
    if let Ok(root) = std::env::var("OPAL_HOME") {
        let _ = dotenvy::from_path(std::path::Path::new(&root).join(".env"));
    } else if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".opal/.env"));
    }

    let cli = Cli::parse();

    // Quiet WARN for stdio serving, INFO elsewhere; always stderr, no ANSI
    let log_level = match &cli.command {
        None | Some(Commands::Serve) | Some(Commands::Tool { .. }) => Level::WARN,
        Some(Commands::Config { .. }) => Level::WARN,
    };
    let level = std::env::var("OPAL_LOG")
        .ok()
        .and_then(|raw| raw.parse::<Level>().ok())
        .unwrap_or(log_level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let code = match &cli.command {
        None | Some(Commands::Serve) => match cli::serve::run_server(&cli).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("opal: {e}");
                e.exit_code()
            }
        },
        Some(Commands::Tool { name, args }) => match cli::tool::run_tool(&cli, name, args).await {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(e) => {
                eprintln!("opal: {e}");
                e.exit_code()
            }
        },
        Some(Commands::Config { action }) => {
            let result = match action {
                ConfigAction::Show => cli::config::run_config_show(),
                ConfigAction::Set { key, value } => cli::config::run_config_set(key, value),
            };
            match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("opal: {e}");
                    e.exit_code()
                }
            }
        }
    };

    std::process::exit(code);
}
