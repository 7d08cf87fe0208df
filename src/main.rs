use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blobpool::ctl::BucketCtl;
use blobpool::logging::LogSink;
use blobpool::proxy::ProxyServer;
use blobpool::transport::http::HttpTransport;
use blobpool::ProxyConfig;

#[derive(Parser)]
#[command(name = "blobpool")]
#[command(version, about = "Bucket-aware HTTP proxy for a replicated blob store", long_about = None)]
struct Cli {
    /// Proxy config file (YAML)
    #[arg(long)]
    config: String,

    /// Buckets file (newline separated list of bucket names)
    #[arg(long)]
    buckets: String,

    /// Listen address override (defaults to the config value)
    #[arg(long)]
    listen: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The sink starts on stderr; the first config load points it at the
    // configured log file.
    let log_sink = LogSink::stderr();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(log_sink.clone()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(cli, log_sink))
}

async fn async_main(cli: Cli, log_sink: LogSink) -> Result<()> {
    // Remotes come from the same config file the controller reloads;
    // read it once up front to wire the transport.
    let boot_config = ProxyConfig::load(&cli.config)?;
    if boot_config.remotes.is_empty() {
        anyhow::bail!("config file lists no storage node remotes");
    }

    let transport = Arc::new(HttpTransport::new(boot_config.remotes.clone()));

    let ctl = BucketCtl::new(transport, &cli.buckets, &cli.config, log_sink).await?;
    ctl.spawn_background();

    let listen = cli.listen.unwrap_or_else(|| ctl.config().listen.clone());
    ProxyServer::new(ctl, listen).run().await
}
