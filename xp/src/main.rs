mod admin;
mod config;
mod http;
mod observability;

use crate::admin::AdminService;
use crate::config::{Config, ConfigError};
use crate::observability::ObservabilityError;
use clap::{Args, Parser};
use std::path::PathBuf;
use treatment::config::Config as TreatmentServiceConfig;
use treatment::feed::NoopFeed;
use treatment::{TreatmentError, TreatmentService};

#[derive(Parser)]
#[command(name = "xp", about = "Experimentation platform services")]
enum CliCommand {
    /// Serve treatments for the subscribed projects
    TreatmentService(ServiceArgs),
}

#[derive(Args)]
struct ServiceArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config has no treatment_service section")]
    MissingSection,
    #[error(transparent)]
    Observability(#[from] ObservabilityError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Treatment(#[from] TreatmentError),
}

fn main() -> Result<(), CliError> {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::TreatmentService(args) => {
            let config = Config::from_file(&args.config)?;
            let treatment_config = config.treatment_service.ok_or(CliError::MissingSection)?;

            let logging = config.common.logging.unwrap_or_default();
            let _sentry_guard = observability::init_logging(&logging)?;
            if let Some(metrics) = &config.common.metrics {
                observability::init_metrics(metrics)?;
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_treatment_service(treatment_config))
        }
    }
}

async fn run_treatment_service(mut config: TreatmentServiceConfig) -> Result<(), CliError> {
    tracing::info!(projects = ?config.project_ids, "Starting treatment service");
    // No update feed transport is attached, so the poller keeps the store current
    if config.ensure_polling() {
        tracing::warn!(
            interval_secs = config.poller.interval_secs,
            "No update feed attached; enabling polling"
        );
    }

    let service = TreatmentService::from_config(&config, Box::new(NoopFeed::default())).await?;
    let admin = AdminService::new(service.clone());

    let served = tokio::select! {
        result = http::run_http_service(&config.listener.host, config.listener.port, admin) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    service.shutdown().await?;
    tracing::info!("Treatment service stopped");
    Ok(served?)
}
