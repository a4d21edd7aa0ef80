//! Exposes the command line application.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cacheproxy_service::config::Config;
use cacheproxy_service::metrics;
use cacheproxy_service::origin::SystemResolver;
use cacheproxy_service::proxy::Proxy;
use clap::Parser;

use crate::logging;

/// A caching forward proxy for HTTP/1.0.
///
/// Clients send `GET` requests with absolute URLs. The first request for a URL fetches it from
/// the origin, concurrent requests for the same URL wait for that fetch and share its response.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The port to listen on.
    ///
    /// Overrides the port of `bind` in the configuration file.
    #[arg(long, short, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Loads the configuration file and applies the command line overrides.
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::get(self.config.as_deref()).context("failed loading config")?;
        config.bind.set_port(self.port);
        Ok(config)
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to set up metrics")?;
    }

    let proxy = Proxy::bind(&config, Arc::new(SystemResolver))
        .context("failed to start the proxy")?;

    let shutdown = proxy.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        shutdown.stop();
    })
    .context("failed to install the shutdown handler")?;

    proxy.run();

    Ok(())
}
