use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs as _},
    time,
};

use reqwest::Url;
use serde::Deserialize;

use crate::CommandLineConf;

const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Deserialize)]
struct RawConfig {
    listen: Option<String>,
    acs_url: Option<String>,
    proxy_host: Option<String>,
    verbose: Option<u8>,
    connect_timeout: Option<u64>,
    stream_timeout: Option<u64>,
    max_body_size: Option<usize>,
}

pub struct Config {
    pub listen: SocketAddr,
    pub acs_url: Url,
    pub acs_addr: SocketAddr,
    pub acs_host: String,
    pub proxy_host: String,
    pub verbose: log::LevelFilter,
    pub connect_timeout: time::Duration,
    pub stream_timeout: time::Duration,
    pub max_body_size: usize,
}

impl TryFrom<CommandLineConf> for Config {
    type Error = anyhow::Error;

    fn try_from(conf: CommandLineConf) -> std::result::Result<Self, Self::Error> {
        get_config(conf)
    }
}

fn get_config(args: CommandLineConf) -> Result<Config> {
    let config_as_file = args
        .config
        .map(|file| fs::read_to_string(file).context("Could not open/read config file."))
        .transpose()?;

    let (
        listen,
        acs_url,
        proxy_host,
        verbose,
        connect_timeout,
        stream_timeout,
        max_body_size,
    ) = if let Some(config_file) = config_as_file {
        let raw_config: RawConfig =
            toml::from_str(&config_file).context("failed to parse config file.")?;

        let listen: SocketAddr = raw_config
            .listen
            .ok_or(anyhow!("Missing listen address"))
            .and_then(|s| s.parse::<SocketAddr>().context("Bad listen address."))?;

        let acs_url = raw_config
            .acs_url
            .ok_or(anyhow!("Missing ACS URL"))
            .and_then(|s| Url::parse(&s).context("Bad ACS URL."))?;

        (
            listen,
            acs_url,
            raw_config.proxy_host,
            raw_config.verbose,
            raw_config.connect_timeout,
            raw_config.stream_timeout,
            raw_config.max_body_size,
        )
    } else {
        (
            args.listen.ok_or(anyhow!("Missing listen address"))?,
            args.acs_url.ok_or(anyhow!("Missing ACS URL"))?,
            args.proxy_host,
            Some(args.verbose),
            args.connect_timeout,
            args.stream_timeout,
            args.max_body_size,
        )
    };

    let proxy_host = match proxy_host {
        Some(host) => validate_proxy_host(host)?,
        None => listen.to_string(),
    };

    let verbose = verbose.map_or(log::LevelFilter::Warn, |v| match v {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });

    let acs_addr = sockaddr_from_url(&acs_url)?;
    let acs_host = authority_from_url(&acs_url)?;

    // Default: 10 seconds TCP connect timeout towards the ACS
    let connect_timeout = connect_timeout
        .map(time::Duration::from_secs)
        .unwrap_or(time::Duration::from_secs(10));

    // Default: 300 seconds (5 minutes) read/write timeout, CWMP sessions can idle
    // while the CPE applies a configuration
    let stream_timeout = stream_timeout
        .map(time::Duration::from_secs)
        .unwrap_or(time::Duration::from_secs(300));

    let max_body_size = max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);

    Ok(Config {
        listen,
        acs_url,
        acs_addr,
        acs_host,
        proxy_host,
        verbose,
        connect_timeout,
        stream_timeout,
        max_body_size,
    })
}

/// The proxy host ends up verbatim in `http://{host}/client?origin=...`.
fn validate_proxy_host(host: String) -> Result<String> {
    let host = host.trim().to_string();

    if host.is_empty() {
        bail!("Proxy host must not be empty");
    }

    if host.contains("://") || host.contains('/') || host.contains('?') {
        bail!("Proxy host must be a bare HOST:PORT, got '{}'", host);
    }

    Ok(host)
}

fn authority_from_url(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host: {}", url))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub fn sockaddr_from_url(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host()
        .ok_or_else(|| anyhow!("URL has no host: {}", url))?;

    let port: u16 = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("URL has no port and unknown scheme: {}", url))?;

    let address = format!("{}:{}", host, port);

    let addresses: Vec<SocketAddr> = address
        .to_socket_addrs()
        .with_context(|| format!("Couldn't resolve or build socket address from URL: {}", url))?
        .collect();

    addresses
        .first()
        .copied()
        .ok_or_else(|| anyhow!("No valid socket address resolved for URL: {}", url))
}
