//! Vesper: durable deferred-job scheduler
//!
//! Main binary with subcommands:
//! - `run`: Continuous scheduler loop until Ctrl-C
//! - `tick`: Execute one tick (for cron or other external triggers)
//! - `schedule`: Add a job
//! - `list` / `show`: Inspect the job store

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod daemon;
mod handlers;
mod store;

use store::StoreArgs;

#[derive(Parser)]
#[command(name = "vesper")]
#[command(about = "Durable deferred-job scheduler", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Run,

    /// Run a single tick and print its counters as JSON
    Tick,

    /// Schedule a job and print its id
    Schedule {
        /// Job type, matched against registered handlers at execution time
        job_type: String,

        /// Absolute due time (RFC 3339)
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<String>,

        /// Due time relative to now, in seconds
        #[arg(long)]
        in_secs: Option<u64>,

        /// JSON object handed to the handler
        #[arg(long)]
        payload: Option<String>,
    },

    /// List jobs as JSON
    List {
        /// Only pending jobs, earliest first
        #[arg(long)]
        pending: bool,
    },

    /// Show one job as JSON
    Show {
        /// Job id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON output on stdout stays parseable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vesper=info,vesper_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let scheduler = cli.store.open_scheduler()?;

    match cli.command {
        Commands::Run => daemon::run(scheduler).await,

        Commands::Tick => commands::tick(&scheduler).await,

        Commands::Schedule {
            job_type,
            at,
            in_secs,
            payload,
        } => {
            commands::schedule(
                &scheduler,
                &job_type,
                at.as_deref(),
                in_secs,
                payload.as_deref(),
            )
            .await
        }

        Commands::List { pending } => commands::list(&scheduler, pending).await,

        Commands::Show { id } => commands::show(&scheduler, &id).await,
    }
}
