//! pump-mint-monitor entry point.
//!
//! Loads configuration, installs logging, and supervises the stream until
//! Ctrl-C.

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pump_mint_monitor::config::{LogFormat, MonitorConfig};
use pump_mint_monitor::mint::MintLogger;
use pump_mint_monitor::supervisor::{Supervisor, SupervisorExit};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = MonitorConfig::from_env()?;
    init_tracing(config.log_format);

    info!(
        endpoint = %config.endpoint,
        account = %config.account_filter,
        commitment = %config.commitment,
        ping_interval_ms = u64::try_from(config.ping_interval.as_millis()).unwrap_or(u64::MAX),
        "starting pump mint monitor"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(event = "shutdown_requested", "received ctrl-c, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => warn!(event = "signal_handler_failed", error = %err),
        }
    });

    let mut handler = MintLogger::new();
    let mut supervisor = Supervisor::new(
        config.connector(),
        &config.subscription_request(),
        config.supervisor_settings(),
    );

    match supervisor.run(&mut handler, shutdown_rx).await {
        SupervisorExit::Shutdown => {}
        SupervisorExit::ConnectFailed(err) => {
            error!(event = "monitor_stopped", error = %err, "monitoring stopped after connect failure");
        }
        SupervisorExit::RetriesExhausted { failures, last_error } => {
            error!(
                event = "monitor_stopped",
                failures,
                error = ?last_error.map(|err| err.to_string()),
                "monitoring stopped after repeated failures"
            );
        }
    }

    info!(
        connect_attempts = supervisor.connect_attempts(),
        tokens_seen = handler.seen(),
        "monitor stopped"
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}
