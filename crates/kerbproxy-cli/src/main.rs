//! kerbproxy - issue requests through a Kerberos-protected proxy
//!
//! Sends a batch of concurrent GET requests through the configured proxy and
//! reports how each one fared. Useful for checking that a ticket or principal
//! works against a proxy before wiring the client into an application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use log::{debug, info};

use kerbproxy_client::{HelperProvider, ProxiedClient};
use kerbproxy_common::ProxyAuthConfig;

mod display;
mod paths;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    /// (default: ~/.config/kerbproxy/config.toml, if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Proxy host name, overrides the configuration file
    #[arg(long)]
    proxy_host: Option<String>,

    /// Proxy port, overrides the configuration file
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Principal to log in as (secret read from KERBPROXY_SECRET)
    #[arg(long)]
    principal: Option<String>,

    /// Command that prints negotiation tokens
    #[arg(long, env = "KERBPROXY_HELPER")]
    helper: Option<String>,

    /// Number of requests to send
    #[arg(long, default_value_t = 1)]
    requests: usize,

    /// Maximum requests in flight
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// URL to fetch through the proxy
    url: String,
}

fn load_file(args: &Args) -> Result<Option<ProxyAuthConfig>> {
    if let Some(path) = &args.config {
        let config = ProxyAuthConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        return Ok(Some(config));
    }

    match paths::default_config_path() {
        Some(path) if path.exists() => {
            debug!("using configuration file {}", path.display());
            let config = ProxyAuthConfig::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            Ok(Some(config))
        }
        _ => Ok(None),
    }
}

/// Merges the configuration file with command line overrides.
fn build_config(args: &Args, file: Option<ProxyAuthConfig>) -> Result<ProxyAuthConfig> {
    let mut config = match (file, &args.proxy_host) {
        (Some(config), None) => config,
        (Some(mut config), Some(host)) => {
            config.proxy_host.clone_from(host);
            config
        }
        (None, Some(host)) => ProxyAuthConfig::new(host.clone()),
        (None, None) => bail!("No proxy configured: pass --proxy-host or --config"),
    };

    if let Some(port) = args.proxy_port {
        config = config.with_proxy_port(port);
    }
    if let Some(principal) = &args.principal {
        config = config.with_principal(principal.clone());
    }
    if let Some(helper) = &args.helper {
        config = config.with_helper_command(helper.clone());
    }

    config.validate()?;
    if config.helper_command.is_none() {
        bail!("No helper command configured: pass --helper or set helper_command");
    }
    Ok(config)
}

/// Parses `url` and reports whether it needs an authenticated tunnel.
fn check_url(url: &str) -> Result<bool> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    match parsed.scheme() {
        "http" => Ok(false),
        "https" => Ok(true),
        scheme => bail!("Unsupported URL scheme: {scheme}"),
    }
}

async fn run(
    client: ProxiedClient,
    url: &str,
    tunnelled: bool,
    requests: usize,
    concurrency: usize,
) -> usize {
    let mut outcomes = futures::stream::iter(1..=requests)
        .map(|index| {
            let client = client.clone();
            async move {
                let started = Instant::now();
                let outcome = if tunnelled {
                    client.get_tunnelled(url).await
                } else {
                    client.get(url).send().await.map_err(Into::into)
                };
                (index, outcome, started.elapsed())
            }
        })
        .buffer_unordered(concurrency.max(1));

    let mut failed = 0;
    while let Some((index, outcome, elapsed)) = outcomes.next().await {
        match outcome {
            Ok(response) => {
                let status = response.status();
                display::display_response(index, status, url, elapsed);
                if !status.is_success() {
                    failed += 1;
                }
            }
            Err(err) => {
                display::display_failure(index, url, &anyhow::Error::new(err));
                failed += 1;
            }
        }
    }
    failed
}

fn config_source(path: Option<&Path>) -> String {
    path.map_or_else(|| "command line".to_string(), |p| p.display().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let tunnelled = check_url(&args.url)?;

    let config = build_config(&args, load_file(&args)?)?;
    info!(
        "authenticating to {} (configuration from {})",
        config.proxy_url(),
        config_source(args.config.as_deref())
    );

    let provider = HelperProvider::from_config(&config)?;
    let client = ProxiedClient::new(config, Arc::new(provider))?;

    let started = Instant::now();
    let failed = run(
        client,
        &args.url,
        tunnelled,
        args.requests,
        args.concurrency,
    )
    .await;
    display::display_summary(args.requests - failed, failed, started.elapsed());

    if failed > 0 {
        bail!("{failed} of {} requests failed", args.requests);
    }
    Ok(())
}
