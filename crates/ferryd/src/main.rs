//! ferryd — serves files and direct messages over the ferry protocol, and
//! doubles as a client for poking at another instance.

use std::sync::Arc;

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_core::wire::DEFAULT_PORT;
use ferry_engine::{EngineConfig, Listener};

mod client;
mod serve;

fn print_usage() {
    println!("Usage: ferryd [command]");
    println!();
    println!("Commands:");
    println!("  serve                          Listen for peers (default)");
    println!("  send   <host[:port]> <text>    Send a direct message, print the reply");
    println!("  list   <host[:port]> [folder]  List a shared folder (the root by default)");
    println!("  fetch  <host[:port]> <path>    Download a file into the current directory");
    println!("  push   <host[:port]> <file>    Upload a file to the peer");
    println!();
    println!("Options:");
    println!("  --cancel-after <ms>   fetch: cancel the download after this many milliseconds");
    println!();
    println!("Port defaults to {DEFAULT_PORT}. Logging follows RUST_LOG.");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut cancel_after = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--cancel-after" {
            i += 1;
            let ms: u64 = args
                .get(i)
                .context("--cancel-after requires a value")?
                .parse()
                .context("--cancel-after must be a number of milliseconds")?;
            cancel_after = Some(std::time::Duration::from_millis(ms));
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    let engine = EngineConfig::from(&config.transfer);
    match remaining.as_slice() {
        ["serve"] | [] => run_server(config).await,
        ["send", peer, text] => client::send(peer, text, engine).await,
        ["list", peer] => client::list(peer, None, engine).await,
        ["list", peer, folder] => client::list(peer, Some(*folder), engine).await,
        ["fetch", peer, path] => client::fetch(peer, path, cancel_after, engine).await,
        ["push", peer, file] => client::push(peer, file, engine).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

async fn run_server(config: FerryConfig) -> Result<()> {
    std::fs::create_dir_all(&config.serve.root)
        .with_context(|| format!("failed to create serve root {}", config.serve.root.display()))?;
    tracing::info!(
        bind = %config.network.bind_addr,
        port = config.network.port,
        root = %config.serve.root.display(),
        staging = %config.transfer.staging_dir.display(),
        timeout_secs = config.transfer.receive_timeout_secs,
        "ferryd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let handler = Arc::new(serve::ServeHandler::new(config.serve.root.clone()));
    let listener = Listener::bind(
        &config.network.bind_addr,
        config.network.port,
        EngineConfig::from(&config.transfer),
        handler,
        shutdown_rx,
    )
    .await?;

    listener.run().await
}
