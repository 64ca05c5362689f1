//! Proxied GET Demo
//!
//! Sends one request through a Kerberos-protected proxy, answering the
//! proxy's challenge with a token produced by a helper command.
//!
//! # Usage
//!
//! ```bash
//! # Ticket already in the cache
//! cargo run --example proxied_get -- \
//!     --proxy-host proxy.com --helper /usr/libexec/spnego-helper \
//!     http://www.google.com/
//!
//! # Let the helper log in
//! KERBPROXY_SECRET=pass cargo run --example proxied_get -- \
//!     --proxy-host proxy.com --principal user \
//!     --helper /usr/libexec/spnego-helper http://www.google.com/
//!
//! # HTTPS goes through an authenticated CONNECT tunnel
//! cargo run --example proxied_get -- \
//!     --proxy-host proxy.com --helper /usr/libexec/spnego-helper \
//!     https://www.google.com/
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use kerbproxy_client::{HelperProvider, ProxiedClient};
use kerbproxy_common::ProxyAuthConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Proxied GET Demo")]
struct Args {
    /// Proxy host name
    #[arg(long, default_value = "proxy.com")]
    proxy_host: String,

    /// Proxy port
    #[arg(long, default_value_t = 3128)]
    proxy_port: u16,

    /// Principal to log in as when no ticket is cached
    #[arg(long)]
    principal: Option<String>,

    /// Command that prints negotiation tokens
    #[arg(long, env = "KERBPROXY_HELPER")]
    helper: String,

    /// URL to fetch
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ProxyAuthConfig::new(args.proxy_host)
        .with_proxy_port(args.proxy_port)
        .with_helper_command(args.helper);
    if let Some(principal) = args.principal {
        config = config.with_principal(principal);
    }
    config.validate()?;

    let provider = HelperProvider::from_config(&config)?;
    let client = ProxiedClient::new(config, Arc::new(provider))?;

    let response = if args.url.starts_with("https://") {
        client.get_tunnelled(&args.url).await?
    } else {
        client.get(&args.url).send().await?
    };
    println!("{} {}", response.status(), args.url);
    let body = response.text().await?;
    println!("{} bytes", body.len());

    Ok(())
}
