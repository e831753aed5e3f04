// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! parserhub - Parser Execution & Distribution Engine
//!
//! One binary, several process roles:
//! - `serve`: host process supervising the continuous runner and restarting
//!   it when any process pushes a change to continuous parsers
//! - `run-group`: one-shot batch run of a group
//! - `continuous`: the continuous runner itself
//! - `pull` / `push`: operator access to the sync protocol

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use parserhub::config::Config;
use parserhub::continuous::ProcessSupervisor;
use parserhub::invalidation::RedisBus;
use parserhub::runtime::{Engine, EngineBuilder};
use parserhub::store::PostgresParserStore;
use parserhub::sync::PushRequest;

#[derive(Parser)]
#[command(name = "parserhub")]
#[command(version, about = "Parser execution and distribution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host process and supervise the continuous runner
    Serve,

    /// Run one group of parsers and print the report
    RunGroup {
        /// Group kind, e.g. `importers`
        kind: String,

        /// Only run these identities
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },

    /// Run every continuous parser until all of them finished
    Continuous,

    /// Print every parser whose hash is not already known
    Pull {
        /// Hashes already held by the caller
        #[arg(long, num_args = 1..)]
        known: Vec<String>,
    },

    /// Apply a push request read from a JSON file (`-` for stdin)
    Push {
        /// Path to `{"upsert": [..], "delete": [..]}`
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parserhub=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::RunGroup { kind, only } => {
            let engine = connect(&config).await?.listen(false).build()?.start().await?;
            let only = (!only.is_empty()).then_some(only);
            let report = engine.run_group(&kind, only.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            engine.shutdown().await;
            Ok(())
        }
        Commands::Continuous => {
            let engine = connect(&config).await?.build()?.start().await?;
            let report = engine.continuous_runner()?.run().await?;
            info!(parsers = report.counts.len(), total = report.total, "Continuous runner exiting");
            engine.shutdown().await;
            Ok(())
        }
        Commands::Pull { known } => {
            let engine = connect(&config).await?.listen(false).build()?.start().await?;
            let documents = engine.pull(&known).await?;
            println!("{}", serde_json::to_string_pretty(&documents)?);
            engine.shutdown().await;
            Ok(())
        }
        Commands::Push { file } => {
            let raw = if file.as_os_str() == "-" {
                let mut raw = String::new();
                std::io::stdin().read_to_string(&mut raw)?;
                raw
            } else {
                std::fs::read_to_string(&file)?
            };
            let request: PushRequest = serde_json::from_str(&raw)?;

            let engine = connect(&config).await?.listen(false).build()?.start().await?;
            let response = engine.push(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            engine.shutdown().await;
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let supervisor = Arc::new(ProcessSupervisor::current_exe()?);
    let engine = connect(config)
        .await?
        .supervisor(supervisor)
        .build()?
        .start()
        .await?;

    engine.start_continuous().await?;
    info!("parserhub host ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    info!("parserhub shut down");
    Ok(())
}

/// Connect to PostgreSQL and Redis and prepare an engine builder.
async fn connect(config: &Config) -> anyhow::Result<EngineBuilder> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database");

    parserhub::migrations::run_postgres(&pool).await?;
    info!("Database schema verified");

    let bus = RedisBus::connect(&config.redis_url, config.invalidation_channel.clone()).await?;
    info!(channel = %bus.channel(), "Connected to invalidation broker");

    Ok(Engine::builder()
        .config(config)
        .store(Arc::new(PostgresParserStore::new(pool)))
        .bus(Arc::new(bus))
        .log_sinks())
}
