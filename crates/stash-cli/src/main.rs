//! `stash` CLI: store, fetch, and delete payloads on any storage backend.
//!
//! The backend is selected from `STASH_*` environment variables (see
//! [`config`]). Payloads go to stdout; logs go to stderr as JSON, so output
//! can be piped safely.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stash_storage::{CancelToken, ErrorKind, StorageError};
use tracing::{debug, warn};

use crate::config::StashConfig;

/// Exit status when a live record already exists.
const EXIT_CONFLICT: u8 = 3;
/// Exit status when no live record exists.
const EXIT_NOT_FOUND: u8 = 4;
/// Exit status after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

/// stash: write-once, TTL-aware blob storage.
#[derive(Parser)]
#[command(
    name = "stash",
    version,
    about = "Store, fetch, and delete payloads on a stash storage backend",
    long_about = None,
    after_help = "Environment variables:\n  \
        STASH_BACKEND         memory | file | sqlite | redis | s3 (default: file)\n  \
        STASH_DATA_DIR        file backend directory (default: ./data)\n  \
        STASH_ENCRYPTION_KEY  hex AES key; encrypts payloads on buffered backends\n\n\
        Exit status:\n  \
        0 success, 1 error, 3 conflict, 4 not found, 130 interrupted\n\n\
        Examples:\n  \
        stash put report.pdf --file ./report.pdf --ttl 3600\n  \
        echo hello | stash put greeting\n  \
        stash get report.pdf --output ./copy.pdf",
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a payload under KEY. Fails if a live record already exists.
    Put {
        /// Identifier to store under.
        key: String,
        /// Read the payload from this file instead of stdin.
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// Seconds until the record expires (0 = never).
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },
    /// Write the payload stored under KEY to stdout.
    Get {
        /// Identifier to fetch.
        key: String,
        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Delete KEY. Deleting a missing key succeeds.
    Delete {
        /// Identifier to delete.
        key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match StashConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    }
}

/// Initialize structured logging on stderr.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}

async fn run(command: Commands, config: &StashConfig) -> Result<()> {
    let store = store::open(config).await?;
    let cancel = cancel_on_interrupt();

    let outcome = match command {
        Commands::Put { key, file, ttl } => {
            let ttl = Duration::from_secs(ttl);
            let bytes = store.put(&cancel, &key, file.as_deref(), ttl).await?;
            println!(
                "{}",
                serde_json::json!({ "key": key, "bytes": bytes, "ttl_secs": ttl.as_secs() })
            );
            Ok(())
        }
        Commands::Get { key, output } => {
            let bytes = store.get(&cancel, &key, output.as_deref()).await?;
            debug!(key = %key, bytes, "payload written");
            Ok(())
        }
        Commands::Delete { key } => {
            store.delete(&key).await?;
            println!("{}", serde_json::json!({ "key": key, "deleted": true }));
            Ok(())
        }
    };

    store.close().await?;
    outcome
}

/// A token that fires on Ctrl-C.
fn cancel_on_interrupt() -> CancelToken {
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfer");
            trigger.cancel();
        }
    });
    token
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    let Some(storage) = err.downcast_ref::<StorageError>() else {
        return ExitCode::FAILURE;
    };
    if matches!(storage, StorageError::Cancelled) {
        return ExitCode::from(EXIT_INTERRUPTED);
    }
    match storage.kind() {
        ErrorKind::Conflict => ExitCode::from(EXIT_CONFLICT),
        ErrorKind::NotFound => ExitCode::from(EXIT_NOT_FOUND),
        ErrorKind::Unexpected => ExitCode::FAILURE,
    }
}
