mod config;

use std::{net::SocketAddr, path::PathBuf};

use config::Config;

use reqwest::Url;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{debug, info, warn};
use tokio::signal;

use cwmp_proxy::cwmp::CwmpMessage;
use cwmp_proxy::tcp_proxy::CwmpProxy;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay CWMP (TR-069) sessions to an ACS, rewriting each CPE's ConnectionRequestURL so the ACS reaches it through a local proxy.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLineConf {
    /// TOML config file.
    #[clap(short, long, value_name = "/path/to/config.toml", conflicts_with_all(&["listen", "acs_url", "proxy_host", "connect_timeout", "stream_timeout", "max_body_size"]))]
    config: Option<PathBuf>,

    /// IP address & port CPEs connect to.
    #[clap(short, long, value_name = "IP:PORT", required_unless_present("config"), value_parser)]
    listen: Option<SocketAddr>,

    /// URL of the upstream ACS.
    #[clap(short, long, value_name = "URL", required_unless_present("config"), value_parser = Url::parse)]
    acs_url: Option<Url>,

    /// Host & port written into rewritten ConnectionRequestURLs (default: the listen address).
    #[clap(short = 'p', long, value_name = "HOST:PORT")]
    proxy_host: Option<String>,

    /// TCP connect timeout towards the ACS, in seconds.
    #[clap(long, value_name = "SECONDS")]
    connect_timeout: Option<u64>,

    /// TCP read/write timeout for active sessions, in seconds.
    #[clap(long, value_name = "SECONDS")]
    stream_timeout: Option<u64>,

    /// Largest accepted request body, in bytes.
    #[clap(long, value_name = "BYTES")]
    max_body_size: Option<usize>,

    /// Verbosity level. The more v, the more verbose.
    #[clap(short, long, action=ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommandLineConf::parse();

    let config = Config::try_from(args)?;

    init_logging(config.verbose);

    println!("cwmp-proxy v{}", VERSION);

    debug!(target: "cwmpproxy", "Listen: {}, ACS URL: '{}' ({}), proxy host: {}, verbosity: {}", config.listen, config.acs_url, config.acs_addr, config.proxy_host, config.verbose);

    if config.proxy_host.starts_with("0.0.0.0") || config.proxy_host.starts_with("[::]") {
        warn!(target: "cwmpproxy", "Proxy host '{}' is not routable, the ACS won't be able to reach it. Set --proxy-host.", config.proxy_host);
    }

    let listener = CwmpProxy::bind(config.listen)
        .with_context(|| format!("Unable to bind proxy address {}", config.listen))?;

    let proxy = CwmpProxy::new(
        CwmpMessage::new(config.proxy_host),
        config.acs_addr,
        config.acs_host,
        config.connect_timeout,
        config.stream_timeout,
        config.max_body_size,
    );

    let _proxy_thread = proxy.start(listener);

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!(target: "cwmpproxy", "Received Ctrl-C, shutting down.");

    Ok(())
}

fn init_logging(verbosity: log::LevelFilter) -> log::LevelFilter {
    fern::Dispatch::new().
        format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        }).
        // by default only accept warning messages from libraries so we don't spam
        level(log::LevelFilter::Warn).
        // but accept Info and Debug and Trace for our app.
        level_for("cwmpproxy", verbosity).
        chain(std::io::stdout()).
        apply().
            expect("Failed to configure logging.");

    verbosity
}
