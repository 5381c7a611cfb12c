//! `strata-server`: run a Strata broker until interrupted.
//!
//! Usage: `strata-server [--config <file>]`. Without `--config` the usual
//! search paths are tried; `STRATA_*` environment variables override both.

use anyhow::{bail, Context};
use strata_broker::Broker;
use strata_core::{config::ConfigLoader, telemetry::init_tracing};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let mut loader = ConfigLoader::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().context("--config needs a file path")?;
                loader = loader.with_file(path);
            },
            other => bail!("unknown argument '{other}'"),
        }
    }

    let config = loader.load().context("failed to load configuration")?;
    init_tracing(&config.logging).context("failed to initialise logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.effective_worker_threads())
        .thread_name("strata-worker")
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let broker = Broker::new(config)?;
        let handle = broker.start().await?;
        info!(address = %handle.local_addr(), "Strata server running, press Ctrl+C to exit");

        tokio::signal::ctrl_c().await?;
        info!("Interrupt received, shutting down");
        handle.shutdown().await?;
        Ok(())
    })
}
