//! The `mapterhorn` binary.

use clap::Parser;
use mapterhorn_runner::{Cli, Pipeline};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())))
        .init();
    mapterhorn_metrics::describe_metrics();

    let pipeline = match cli.pipeline_config().and_then(Pipeline::open) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let stop = pipeline.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("stopping after running units finish...");
        stop.store(true, Ordering::Relaxed);
    }) {
        warn!("could not install Ctrl-C handler: {}", e);
    }

    match cli.execute(&pipeline) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}
