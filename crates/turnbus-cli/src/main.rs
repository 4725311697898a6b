//! turnbus - operator CLI for the event bus.
//!
//! Drives the migration ledger and archive batch runs against the same
//! configuration the daemon reads from the environment.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// turnbus - event bus operations
#[derive(Parser, Debug)]
#[command(name = "turnbus")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// Extra directory of .sql files applied after the embedded set,
        /// in sorted filename order
        #[arg(long)]
        dir: Option<std::path::PathBuf>,
    },

    /// Archive a seq range of one thread into the object store
    Archive {
        /// Thread to archive
        #[arg(long)]
        thread_id: String,

        /// First seq of the range (inclusive)
        #[arg(long, default_value_t = 1)]
        from_seq: i64,

        /// Last seq of the range (inclusive); defaults to the thread's
        /// current last_seq
        #[arg(long)]
        to_seq: Option<i64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Migrate { dir } => commands::migrate::run(dir.as_deref()),
        Commands::Archive {
            thread_id,
            from_seq,
            to_seq,
        } => commands::archive::run(&thread_id, from_seq, to_seq),
    }
}
