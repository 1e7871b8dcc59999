// crates/opal-server/src/cli/serve.rs
// MCP server initialization and main loop

use super::{Cli, StartupError};
use opal::bus;
use opal::config::{EnvConfig, OpalConfig};
use opal::mcp::OpalServer;
use opal::scheduler::Scheduler;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Build the component graph from config + flags. Shared by `serve` and the
/// one-shot tool runner.
pub async fn init_server(cli: &Cli) -> Result<(OpalServer, EnvConfig, OpalConfig), StartupError> {
    let mut env = EnvConfig::load();
    if let Some(port) = cli.ws_port {
        env.ws_port = port;
    }
    let validation = env.validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }

    let config = OpalConfig::load(&env.config_root);
    let server = OpalServer::new(&env, &config).map_err(|e| StartupError::Init(e.to_string()))?;

    // Startup module selection: --all wins, otherwise --tools csv
    let modules: Vec<String> = if cli.all {
        server.catalog.names()
    } else {
        cli.tools
            .as_deref()
            .map(|csv| {
                csv.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };
    if !modules.is_empty() {
        let mut staged = Vec::new();
        for name in &modules {
            let module = server
                .catalog
                .build(name)
                .map_err(|e| StartupError::Config(e.to_string()))?;
            staged.extend(module.into_tools());
        }
        server
            .registry
            .apply_transaction(&HashSet::new(), staged)
            .map_err(|e| StartupError::Init(e.to_string()))?;
        info!(?modules, "Startup modules loaded");
    }

    // Startup persona: a bad name is a config error, not a crash loop
    if let Some(persona) = &cli.agent {
        let workspace = server.default_workspace.read().await.clone();
        server
            .personas
            .load(&workspace, persona)
            .await
            .map_err(|e| StartupError::Config(format!("--agent {persona}: {e}")))?;
    }

    Ok((server, env, config))
}

/// Run the MCP server with stdio transport, the execution bus, the store
/// flusher, and the scheduler.
pub async fn run_server(cli: &Cli) -> Result<(), StartupError> {
    let (server, env, config) = init_server(cli).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let _flusher = server.store.spawn_flusher(shutdown_rx.clone());

    if env.disable_ws {
        info!("Execution bus disabled (OPAL_DISABLE_WS)");
    } else {
        bus::server::serve(server.bus.clone(), env.ws_port, shutdown_rx.clone())
            .await
            .map_err(|e| StartupError::Init(format!("ws bind failed: {e}")))?;
    }

    let scheduler_enabled =
        config.scheduler.enabled && !cli.no_scheduler && !env.disable_scheduler;
    if scheduler_enabled {
        let scheduler = Arc::new(Scheduler::new(
            &env.config_root,
            server.engine.clone(),
            Some(server.personas.clone()),
            env.scheduler_tz(),
            config.scheduler.clone(),
        ));
        tokio::spawn(scheduler.run(shutdown_rx.clone()));
        info!("Scheduler started");
    } else {
        info!("Scheduler disabled");
    }

    info!(root = %env.config_root.display(), "Opal serving MCP on stdio");

    // Run with stdio transport
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server.clone(), transport)
        .await
        .map_err(|e| StartupError::Init(format!("stdio transport: {e}")))?;
    if let Err(e) = service.waiting().await {
        warn!(error = %e, "MCP service ended with error");
    }

    // Orderly shutdown: stop background work, then force a final flush
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.store.flush_all().await {
        warn!(error = %e, "Final store flush failed");
    }

    Ok(())
}
