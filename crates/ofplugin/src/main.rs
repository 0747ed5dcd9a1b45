// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenFlow controller CLI
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:6653
//! ofplugin
//!
//! # Custom port, debug logging
//! ofplugin --port 6633 --log-level debug run
//!
//! # TLS
//! ofplugin --tls-cert ctl.crt --tls-key ctl.key
//!
//! # Configuration file
//! ofplugin gen-config > ofplugin.toml
//! ofplugin validate ofplugin.toml
//! ofplugin --config ofplugin.toml
//! ```

use clap::{Parser, Subcommand};
use ofplugin::{InMemoryStore, LocalOwnershipService, OpenFlowServer, PluginConfig};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OpenFlow southbound controller
#[derive(Parser, Debug)]
#[command(name = "ofplugin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides the configuration file)
    #[arg(short, long, global = true)]
    bind: Option<IpAddr>,

    /// TCP port to listen on (overrides the configuration file)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// TLS certificate chain (PEM); enables TLS together with --tls-key
    #[arg(long, global = true, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, global = true, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the controller (default)
    Run,

    /// Print a default configuration file
    GenConfig,

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .or_else(|| EnvFilter::try_new(&cli.log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    match cli.command {
        Some(Commands::GenConfig) => cmd_gen_config(),
        Some(Commands::Validate { ref file }) => cmd_validate(file),
        Some(Commands::Run) | None => cmd_run(&cli).await,
    }
}

fn build_config(cli: &Cli) -> Result<PluginConfig, Box<dyn std::error::Error>> {
    let mut config = match cli.config {
        Some(ref path) => {
            info!("Loading config from {:?}", path);
            PluginConfig::from_file(path)?
        }
        None => PluginConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        config.tls_enabled = true;
        config.tls_cert_path = Some(cert.clone());
        config.tls_key_path = Some(key.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(cli)?;
    let stats_interval = config.stats_interval();

    let versions: Vec<String> = config
        .supported_versions
        .iter()
        .map(|v| v.to_string())
        .collect();

    info!("+----------------------------------------------------+");
    info!(
        "|       OpenFlow Controller v{:<24}|",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bind:     {:39} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!(
        "|  TLS:      {:39} |",
        if config.tls_enabled { "enabled" } else { "disabled" }
    );
    info!("|  Versions: {:39} |", versions.join(", "));
    info!(
        "|  Timeout:  {:39} |",
        format!("{}ms", config.request_timeout_ms)
    );
    info!("+----------------------------------------------------+");

    let server = OpenFlowServer::new(
        config,
        Arc::new(LocalOwnershipService::new()),
        Arc::new(InMemoryStore::new()),
    )?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping controller...");
        server_handle.shutdown();
    });

    if let Some(period) = stats_interval {
        let manager = server.manager().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let conns = manager.stats();
                let msgs = manager.message_stats();
                info!(
                    "Stats: {} connection(s), {} device(s), accepted={} established={} \
                     handshake_failures={} refused={} duplicates={} in={} out={} dropped={}",
                    manager.connection_count(),
                    manager.device_count(),
                    conns.accepted,
                    conns.established,
                    conns.handshake_failures,
                    conns.refused,
                    conns.duplicates_closed,
                    msgs.total_inbound(),
                    msgs.total_outbound(),
                    msgs.dropped
                );
            }
        });
    }

    server.run().await?;

    info!("Controller stopped");
    Ok(())
}

fn cmd_gen_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", PluginConfig::default().to_toml()?);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = PluginConfig::from_file(path)?;
    println!("Configuration {} is valid", path.display());
    println!("  Listen:   {}:{}", config.bind_address, config.port);
    println!(
        "  Versions: {}",
        config
            .supported_versions
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  TLS:      {}", config.tls_enabled);
    Ok(())
}
