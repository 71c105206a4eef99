//! Syringe Pump Bus Service (`pumpsrv`)
//!
//! Runs every configured pump on a single cooperative event loop until
//! Ctrl+C or SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use errors::ServiceResult;
use pumpsrv::bootstrap::{self, Args};
use pumpsrv::bus::DispatcherRegistry;
use pumpsrv::runtime::start_pumps;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ServiceResult<()> {
    let args = Args::parse();
    let config = bootstrap::load_configuration(&args)?;
    bootstrap::initialize_logging(&args, &config)?;

    if args.validate {
        bootstrap::validate_configuration(&config);
        return Ok(());
    }

    info!(
        "Starting {} v{}",
        config.service.name,
        env!("CARGO_PKG_VERSION")
    );
    let registry = Arc::new(DispatcherRegistry::new());
    let runtime = start_pumps(&config, registry).await?;

    common::shutdown::wait_for_shutdown().await;
    info!("Shutdown signal received");
    runtime.shutdown().await;

    info!("{} stopped", config.service.name);
    Ok(())
}
