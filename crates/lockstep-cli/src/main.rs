//! Lockstep CLI - Command-line interface for the Lockstep sync engine
//!
//! Provides commands for:
//! - Viewing engine status and per-file records
//! - Queueing uploads and deletions, committing them
//! - Running a sync cycle in the foreground
//! - Resetting the engine after an error
//! - Managing configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    completions::CompletionsCommand,
    config::ConfigCommand,
    file::FileCommand,
    reset::ResetCommand,
    status::StatusCommand,
    sync::{CommitCommand, SyncCommand},
    transfer::{DeleteCommand, UploadCommand},
    CliContext,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "lockstep", version, about = "Client for a Lockstep sync server")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show engine status
    Status(StatusCommand),
    /// Show the local record of one file
    File(FileCommand),
    /// Queue a file for upload
    Upload(UploadCommand),
    /// Queue a file for deletion
    Delete(DeleteCommand),
    /// Commit queued operations and send them
    Commit(CommitCommand),
    /// Run one sync cycle in the foreground
    Sync(SyncCommand),
    /// Leave an error mode or forget local metadata
    Reset(ResetCommand),
    /// View and manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Generate shell completions
    Completions(CompletionsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = OutputFormat::from_flags(cli.json, cli.quiet);

    let ctx = CliContext::new(cli.config);

    match cli.command {
        Commands::Status(cmd) => cmd.execute(&ctx, format).await,
        Commands::File(cmd) => cmd.execute(&ctx, format).await,
        Commands::Upload(cmd) => cmd.execute(&ctx, format).await,
        Commands::Delete(cmd) => cmd.execute(&ctx, format).await,
        Commands::Commit(cmd) => cmd.execute(&ctx, format).await,
        Commands::Sync(cmd) => cmd.execute(&ctx, format).await,
        Commands::Reset(cmd) => cmd.execute(&ctx, format).await,
        Commands::Config(cmd) => cmd.execute(&ctx, format).await,
        Commands::Completions(cmd) => cmd.execute(format).await,
    }
}
