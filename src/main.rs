//! Route resolver CLI.
//!
//! ```text
//!   config.toml ──▶ loader + validation ──▶ RouteTable ──┐
//!                                                       ▼
//!   URL (arg or stdin line) ──────────────────────▶ Resolver ──▶ JSON match
//!                                                       ▲
//!   watcher (file change) ──▶ new RouteTable ──▶ SharedRouteTable swap
//! ```
//!
//! `check` validates a configuration, `resolve` resolves one URL, and
//! `watch` resolves URLs read from stdin while hot-reloading the routes.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use resource_router::config::loader::load_config;
use resource_router::config::watcher::ConfigWatcher;
use resource_router::lifecycle::{signals, Shutdown};
use resource_router::observability::{logging, metrics};
use resource_router::routing::{Resolver, Route, RouteTable, RouterContext, SharedRouteTable};
use resource_router::RouterConfig;

#[derive(Parser)]
#[command(name = "resource-router")]
#[command(about = "Resolve URLs against a declared route table", long_about = None)]
struct Cli {
    /// Route configuration file (TOML)
    #[arg(short, long, default_value = "routes.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and report every problem
    Check,
    /// Resolve a single URL and print the match as JSON
    Resolve {
        url: String,
    },
    /// Resolve URLs read line by line from stdin, reloading routes on change
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init(cli.log_level.as_deref().unwrap_or("info"));
            tracing::error!(path = ?cli.config, "{}", e);
            return Err(e.into());
        }
    };

    logging::init(cli.log_level.as_deref().unwrap_or(&config.observability.log_level));

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let resolver = Resolver::new(&config.resolver);
    let table = build_table(&resolver, &config)?;

    tracing::info!(
        routes = table.len(),
        base_path = %config.base_path,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Check => {
            println!("{}: {} routes OK", cli.config.display(), table.len());
        }
        Commands::Resolve { url } => {
            let context = resolver.resolve_url(&table, &url, &config.base_path);
            println!("{}", serde_json::to_string_pretty(&render(&url, context.as_ref()))?);
        }
        Commands::Watch => {
            watch(&cli.config, config, resolver, table).await?;
        }
    }

    Ok(())
}

fn build_table(resolver: &Resolver, config: &RouterConfig) -> Result<RouteTable, Box<dyn std::error::Error>> {
    let routes = config.routes.iter().map(Route::from).collect();
    Ok(resolver.table(routes)?)
}

fn render(url: &str, context: Option<&RouterContext>) -> serde_json::Value {
    match context {
        Some(context) => json!({
            "url": url,
            "route": context.route.label(),
            "match": context.matched,
            "query": context.query,
        }),
        None => json!({ "url": url, "route": null }),
    }
}

async fn watch(
    path: &Path,
    mut config: RouterConfig,
    resolver: Resolver,
    table: RouteTable,
) -> Result<(), Box<dyn std::error::Error>> {
    let shared = SharedRouteTable::new(table);
    let shutdown = Shutdown::new();
    let mut shutdown_signal = shutdown.subscribe();
    signals::spawn_signal_listener(shutdown.clone());

    let current = tokio::fs::read_to_string(path).await?;
    let (_watch, mut updates) = ConfigWatcher::new(path).spawn(current)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown_signal.wait() => break,
            Some(new_config) = updates.recv() => {
                match build_table(&resolver, &new_config) {
                    Ok(table) => {
                        tracing::info!(routes = table.len(), "Route table reloaded");
                        shared.replace(table);
                        config = new_config;
                    }
                    Err(e) => tracing::error!("Rejected reloaded routes: {}", e),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let url = line.trim();
                if url.is_empty() {
                    continue;
                }
                let table = shared.load();
                let context = resolver.resolve_url(&table, url, &config.base_path);
                println!("{}", serde_json::to_string(&render(url, context.as_ref()))?);
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
