use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tenantry_core::TenantId;
use tenantry_metering::JobKind;
use tenantry_worker::{Worker, WorkerConfig, factory, telemetry};

#[derive(Parser, Debug)]
#[command(name = "tenantry-worker", about = "Upload scanning and usage aggregation for tenantry")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tenantry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume queues and run scheduled jobs until interrupted (default).
    Run,
    /// Create or upgrade the database schema, then exit.
    Migrate,
    /// Run one aggregation job now, then exit.
    RunJob {
        /// `daily-rollup`, `period-rollup` or `period-close`.
        job: JobKind,
    },
    /// Print a tenant's effective limits as JSON.
    Limits {
        #[arg(long)]
        tenant: TenantId,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(&cli.config)?;
    telemetry::init(&config.telemetry);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => factory::migrate(&config.database).await?,
        Commands::RunJob { job } => {
            let worker = Worker::build(config).await?;
            if worker.run_job(job).await?.is_none() {
                warn!(job = %job, "job is already running elsewhere");
            }
        }
        Commands::Limits { tenant } => {
            let worker = Worker::build(config).await?;
            let limits = worker.limits(tenant).await?;
            println!("{}", serde_json::to_string_pretty(&limits)?);
        }
        Commands::Run => {
            let worker = Worker::build(config).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                on_signal.cancel();
            });
            worker.run(cancel).await?;
            info!("worker stopped");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
