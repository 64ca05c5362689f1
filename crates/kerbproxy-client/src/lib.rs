//! # kerbproxy-client
//!
//! SPNEGO/Kerberos authentication for HTTP clients behind a proxy.
//!
//! When the proxy answers `407 Proxy Authentication Required`, the
//! [`ProxyAuthenticationPolicy`] negotiates a token through a
//! [`SecurityProvider`] and resends the request with
//! `Proxy-Authorization: Negotiate <token>`. Token engines are cached per
//! configuration fingerprint in an [`EngineRegistry`], so every request using
//! the same login configuration shares one security context.
//!
//! The crate is organised bottom-up:
//! - [`credentials`]: answers credential requests from a mechanism
//! - [`mechanism`]: the platform security abstraction
//! - [`engine`]: produces tokens for one proxy and fingerprint
//! - [`registry`]: caches engines
//! - [`policy`]: reacts to proxy challenges
//! - [`middleware`] and [`client`]: `reqwest` integration
//! - [`helper`]: a provider backed by an external command
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kerbproxy_client::{HelperProvider, ProxiedClient};
//! use kerbproxy_common::ProxyAuthConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyAuthConfig::new("proxy.com")
//!     .with_credentials("user", "pass")
//!     .with_helper_command("/usr/libexec/spnego-helper");
//!
//! let provider = HelperProvider::from_config(&config)?;
//! let client = ProxiedClient::new(config, Arc::new(provider))?;
//!
//! let response = client.get("http://www.google.com/").send().await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod helper;
pub mod mechanism;
pub mod middleware;
pub mod policy;
pub mod registry;

#[cfg(test)]
mod testing;

pub use client::ProxiedClient;
pub use credentials::{
    CredentialRequest, CredentialSupplier, NoCredentials, StaticCredentialSupplier,
};
pub use engine::{EngineSettings, NegotiationToken, TokenEngine};
pub use error::{
    AuthenticationError, ClientError, CredentialError, NegotiationError, SecurityError,
};
pub use helper::HelperProvider;
pub use mechanism::{
    CanonicalName, ContextLifetime, ContextRequest, HostBasedService, Mechanism, Oid,
    SecurityContext, SecurityProvider,
};
pub use middleware::ProxyAuthMiddleware;
pub use policy::{ChallengeState, ProxyAuthenticationPolicy};
pub use registry::EngineRegistry;
