use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use openevsed::ConfigEntries;
use openevsed::Engine;
use openevsed::api;
use openevsed::config::Config;
use openevsed::format_diagnostics;
use tracing_subscriber::EnvFilter;

/// OpenEVSE charger daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file(s); later files may not redefine fields of earlier ones
    #[arg(short, long = "config", default_value = "openevsed.toml")]
    configs: Vec<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (config, diagnostics) = match Config::from_files(&args.configs) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if !diagnostics.is_empty() {
        eprint!("{}", format_diagnostics(&diagnostics));
    }
    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    // RUST_LOG wins over the configured levels
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.directives()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("openevsed starting");
    tracing::info!(
        "Loaded config from: {}",
        args.configs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let entries = ConfigEntries::load(config.storage.config_entries_path()).await?;
    let mut engine = Engine::new(Arc::new(entries));
    engine.register_integrations_from_config(&config)?;
    let engine = Arc::new(engine);

    let runner = engine.clone();
    let engine_task = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!("Engine stopped: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = if config.api.enabled {
        let engine = engine.clone();
        let (listen, port) = (config.api.listen, config.api.port);
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(engine, listen, port, shutdown_rx).await {
                tracing::error!("HTTP API failed: {}", e);
            }
        }))
    } else {
        tracing::info!("HTTP API disabled");
        None
    };

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    let _ = shutdown_tx.send(());
    if let Some(task) = api_task {
        let _ = task.await;
    }

    tracing::info!("Shutting down integrations...");
    engine.shutdown().await;
    engine_task.abort();

    tracing::info!("openevsed shutdown complete");
    Ok(())
}
