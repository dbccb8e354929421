//! autopilot daemon: loads config, then runs the supervised engine until
//! ctrl-c or until the supervisor gives up.

use anyhow::{Context, Result};
use ap_core::config::Config;
use ap_daemon::daemon::Daemon;
use ap_telemetry::logging::{self, LogFormat};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let format = config.general.log_format.parse().unwrap_or_else(|e| {
        eprintln!("{e}; falling back to human-readable logs");
        LogFormat::Human
    });
    logging::init("ap-daemon", format, &config.general.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %config.data_dir().display(),
        "autopilot daemon starting"
    );

    let daemon = Daemon::new(config).context("failed to initialise daemon")?;
    let shutdown = daemon.shutdown_signal();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon exited with error");
        return Err(e);
    }

    info!("autopilot daemon stopped");
    Ok(())
}
