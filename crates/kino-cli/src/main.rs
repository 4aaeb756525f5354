//! Kino CLI - Headless Content-Protection Tool
//!
//! Features:
//! - Key-system negotiation against a simulated platform
//! - Session lifecycle and teardown simulation

use clap::{Parser, Subcommand};
use kino_protection::KeySystem;
use std::path::PathBuf;

mod commands;
mod output;

/// Kino CLI - Content-protection toolkit
#[derive(Parser)]
#[command(name = "kino-cli")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Content-protection negotiation and session simulation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run key-system negotiation over a configuration's candidates
    Negotiate {
        /// Path to a JSON protection configuration
        config: PathBuf,

        /// Key systems the simulated platform accepts (defaults to all candidates)
        #[arg(short, long)]
        accept: Vec<KeySystem>,
    },

    /// Negotiate, create sessions and tear down
    Lifecycle {
        /// Path to a JSON protection configuration
        config: PathBuf,

        /// Key systems the simulated platform accepts (defaults to all candidates)
        #[arg(short, long)]
        accept: Vec<KeySystem>,

        /// Number of sessions to create
        #[arg(short, long, default_value = "2")]
        sessions: usize,

        /// Make every platform close request fail
        #[arg(long)]
        fail_close: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    kino_protection::init();

    match cli.command {
        Commands::Negotiate { config, accept } => {
            commands::negotiate(&config, &accept, &cli.format).await?;
        }
        Commands::Lifecycle { config, accept, sessions, fail_close } => {
            commands::lifecycle(&config, &accept, sessions, fail_close, &cli.format).await?;
        }
    }

    Ok(())
}
