//! Connections Tester bench director: entry point.
//!
//! Runs the rendezvous listener and a [`Director`] whose sessions monitor
//! every admitted controller link, logging the traffic and the bench state.
//!
//! # Usage
//!
//! ```text
//! tester-director [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML config file [default: platform config dir]
//!   --bind <ADDR>              Address for all sockets [config: 0.0.0.0]
//!   --rendezvous-port <PORT>   Rendezvous port [config: 1500]
//!   --log-level <LEVEL>        Log level when RUST_LOG is unset [config: info]
//! ```
//!
//! Every flag can also be given through its environment variable
//! (`TESTER_CONFIG`, `TESTER_BIND`, `TESTER_RENDEZVOUS_PORT`,
//! `TESTER_LOG_LEVEL`).  Flags override the config file.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  ├─ load_config()          -- file or defaults, then CLI overrides
//!  ├─ start_admission()      -- rendezvous listener → DeviceLink channel
//!  └─ Director::start()      -- MonitorSession per link, rediscovery, state
//!       ├─ boards logger
//!       └─ state logger
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tester_director::application::director::Director;
use tester_director::application::session::{LogErrorReporter, VoltagePreference};
use tester_director::infrastructure::network::admission::start_admission;
use tester_director::infrastructure::network::monitor::MonitorSessionFactory;
use tester_director::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Connections Tester bench director.
///
/// Admits controllers on the rendezvous port and supervises their sessions.
#[derive(Debug, Parser)]
#[command(
    name = "tester-director",
    about = "Bench director for the connections tester controllers",
    version
)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, env = "TESTER_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to bind the rendezvous listener and device links to.
    #[arg(long, env = "TESTER_BIND")]
    bind: Option<String>,

    /// Well-known port controllers knock on.
    #[arg(long, env = "TESTER_RENDEZVOUS_PORT")]
    rendezvous_port: Option<u16>,

    /// `tracing` level used when `RUST_LOG` is unset.
    #[arg(long, env = "TESTER_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the config file and applies the flags on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let mut config = load_config(self.config.as_deref()).context("failed to load config")?;

        if let Some(bind) = self.bind {
            config.network.bind_address = bind;
        }
        if let Some(port) = self.rendezvous_port {
            config.network.rendezvous_port = port;
        }
        if let Some(level) = self.log_level {
            config.tester.log_level = level;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_app_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.tester.log_level)),
        )
        .init();

    let admission_config = config
        .network
        .to_admission_config()
        .context("invalid [network] configuration")?;
    let director_config = config.director.to_director_config();
    let preference = config.tester.clone();

    info!(
        rendezvous = %admission_config.rendezvous_addr(),
        voltage_level = %preference.preferred_level(),
        max_detectable_resistance = config.tester.max_detectable_resistance,
        "connections tester director starting"
    );

    let cancel = CancellationToken::new();
    let (links, admission) = start_admission(admission_config, cancel.child_token());
    let (director, mut boards) = Director::start(
        director_config,
        links,
        Arc::new(MonitorSessionFactory::new(config.tester.max_detectable_resistance)),
        Arc::new(LogErrorReporter),
        Arc::new(preference),
        cancel.clone(),
    );

    // ── Boards logger ─────────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some(inventory) = boards.recv().await {
            let addresses: Vec<_> = inventory.iter().map(|b| b.address()).collect();
            info!(count = addresses.len(), ?addresses, "bench inventory updated");
        }
    });

    // ── State logger ──────────────────────────────────────────────────────────
    let mut state = director.subscribe_state();
    let state_token = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state_token.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    info!(state = %current, "bench state");
                }
            }
        }
    });

    info!("director ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutdown signal received");
    director.shutdown();
    admission.await.context("admission task panicked")?;

    info!("connections tester director stopped");
    Ok(())
}
