//! relaymqd – runs the broker until interrupted.
//
//  $ relaymqd --config relaymq.toml
//
// The daemon has no network peer transport; clustered settings only link
// brokers that share this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use relaymq::config::Config;
use relaymq::core::persistence::MemoryPersistence;
use relaymq::logging::init_logging;
use relaymq::{metrics, BrokerRuntime};

#[derive(Debug, Parser)]
#[command(name = "relaymqd", version, about = "RelayMQ broker daemon")]
struct Cli {
    /// Path to config TOML (env RELAYMQ_CONFIG is used when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Log broker counters at this interval, in seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging().context("installing tracing subscriber")?;
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let settings = config.to_settings();
    if settings.default_admin.is_none() {
        warn!("no administrator configured; set RELAYMQ_ADMIN_USER and RELAYMQ_ADMIN_PASSWORD");
    }

    let runtime = BrokerRuntime::start(settings, Arc::new(MemoryPersistence::new()), None)
        .await
        .context("starting broker")?;

    let reporter = (cli.metrics_interval > 0).then(|| {
        let period = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for line in metrics::snapshot().lines() {
                    info!(target: "relaymq::metrics", "{line}");
                }
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    runtime.shutdown().await;
    Ok(())
}
