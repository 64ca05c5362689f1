//! HTTP client routed through an authenticating proxy.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kerbproxy_client::{HelperProvider, ProxiedClient};
//! use kerbproxy_common::ProxyAuthConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyAuthConfig::new("proxy.example.com").with_credentials("user", "pass");
//! let provider = HelperProvider::new("kinit-helper --print-token");
//!
//! let client = ProxiedClient::new(config, Arc::new(provider))?;
//! let response = client.get("http://www.example.com/").send().await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing Engines Between Clients
//!
//! Clients built with the same [`EngineRegistry`] reuse each other's token
//! engines:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kerbproxy_client::{EngineRegistry, HelperProvider, ProxiedClient};
//! use kerbproxy_common::ProxyAuthConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyAuthConfig::new("proxy.example.com");
//! let registry = Arc::new(EngineRegistry::from_config(
//!     Arc::new(HelperProvider::new("kinit-helper")),
//!     &config,
//! ));
//!
//! let first = ProxiedClient::with_registry(config.clone(), Arc::clone(&registry))?;
//! let second = ProxiedClient::with_registry(config, registry)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Tunnels
//!
//! HTTPS and `wss` traffic reaches the origin through a `CONNECT` tunnel that
//! `reqwest` opens inside its connector, out of reach of middleware. Tunnelled
//! requests therefore carry a token negotiated up front:
//!
//! ```no_run
//! # use kerbproxy_client::ProxiedClient;
//! # async fn example(client: ProxiedClient) -> Result<(), kerbproxy_client::ClientError> {
//! let response = client.get_tunnelled("https://www.example.com/").await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! WebSocket clients that open their own `CONNECT` can take the header from
//! [`ProxiedClient::tunnel_authorization`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::header::HeaderValue;
use reqwest::{IntoUrl, Response};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{
    Jitter, RetryTransientMiddleware, Retryable, RetryableStrategy, default_on_request_failure,
    default_on_request_success, policies::ExponentialBackoff,
};
use tokio::sync::Mutex;

use kerbproxy_common::{ProxyAuthConfig, RetryConfig};

use crate::error::{ClientError, is_tunnel_rejection};
use crate::mechanism::SecurityProvider;
use crate::middleware::ProxyAuthMiddleware;
use crate::policy::ProxyAuthenticationPolicy;
use crate::registry::EngineRegistry;

/// A `reqwest` client that sends every request through the configured proxy
/// and answers its SPNEGO challenges.
#[derive(Clone)]
pub struct ProxiedClient {
    client: ClientWithMiddleware,
    policy: Arc<ProxyAuthenticationPolicy>,
    config: Arc<ProxyAuthConfig>,
    /// Client whose proxy presents the current tunnel token, shared by clones
    tunnel: Arc<Mutex<Option<ClientWithMiddleware>>>,
}

impl ProxiedClient {
    /// Creates a client with its own engine registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        config: ProxyAuthConfig,
        provider: Arc<dyn SecurityProvider>,
    ) -> Result<Self, ClientError> {
        let registry = Arc::new(EngineRegistry::from_config(provider, &config));
        Self::with_registry(config, registry)
    }

    /// Creates a client drawing engines from a shared registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn with_registry(
        config: ProxyAuthConfig,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let policy = Arc::new(ProxyAuthenticationPolicy::from_config(&config, registry));
        let client = build_client(&config, &policy, None)?;

        Ok(Self {
            client,
            policy,
            config: Arc::new(config),
            tunnel: Arc::new(Mutex::new(None)),
        })
    }

    /// Starts a `GET` request.
    ///
    /// Plain-HTTP requests are authenticated when the proxy challenges them.
    /// `https` URLs are tunnelled without a token; use
    /// [`ProxiedClient::get_tunnelled`] for those.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.client.get(url)
    }

    /// Sends a `GET` whose `CONNECT` tunnel carries a negotiated token.
    ///
    /// The token is negotiated on first use and kept for later tunnels. When
    /// the proxy rejects it, a fresh token is negotiated and the request is
    /// sent once more.
    ///
    /// # Errors
    ///
    /// Returns an error if negotiation fails, the proxy rejects the fresh
    /// token as well, or the request itself fails.
    pub async fn get_tunnelled<U: IntoUrl>(&self, url: U) -> Result<Response, ClientError> {
        let url = url.into_url()?;
        let client = self.tunnel_client(false).await?;
        match client.get(url.clone()).send().await {
            Err(err) if is_tunnel_rejection(&err) => {
                debug!("proxy {} rejected the tunnel token", self.config.proxy_host);
                let client = self.tunnel_client(true).await?;
                Ok(client.get(url).send().await?)
            }
            outcome => Ok(outcome?),
        }
    }

    /// Negotiates a fresh `Proxy-Authorization` value for a `CONNECT` the
    /// caller sends itself.
    ///
    /// # Errors
    ///
    /// Returns an error if negotiation fails.
    pub async fn tunnel_authorization(&self) -> Result<HeaderValue, ClientError> {
        Ok(self.policy.authorization_header().await?)
    }

    async fn tunnel_client(&self, renew: bool) -> Result<ClientWithMiddleware, ClientError> {
        let mut tunnel = self.tunnel.lock().await;
        if !renew && let Some(client) = tunnel.as_ref() {
            return Ok(client.clone());
        }
        let header = self.tunnel_authorization().await?;
        let client = build_client(&self.config, &self.policy, Some(header))?;
        *tunnel = Some(client.clone());
        Ok(client)
    }

    /// The underlying middleware client.
    #[must_use]
    pub const fn client(&self) -> &ClientWithMiddleware {
        &self.client
    }

    /// The policy answering proxy challenges.
    #[must_use]
    pub fn policy(&self) -> &ProxyAuthenticationPolicy {
        &self.policy
    }

    /// The configuration this client was built from.
    #[must_use]
    pub fn config(&self) -> &ProxyAuthConfig {
        &self.config
    }
}

/// Builds the middleware stack; `tunnel_auth` is presented on `CONNECT` and
/// on forwarded requests that carry no header of their own.
fn build_client(
    config: &ProxyAuthConfig,
    policy: &Arc<ProxyAuthenticationPolicy>,
    tunnel_auth: Option<HeaderValue>,
) -> Result<ClientWithMiddleware, ClientError> {
    let mut proxy = reqwest::Proxy::all(config.proxy_url())?;
    if let Some(header) = tunnel_auth {
        proxy = proxy.custom_http_auth(header);
    }

    // None means no timeout
    let mut builder = reqwest::Client::builder().proxy(proxy);
    if let Some(timeout) = config.timeout_seconds {
        builder = builder.timeout(Duration::from_secs(timeout));
    }
    let http = builder.build()?;

    // Authentication runs inside the retry loop so each transient retry
    // starts from an unauthenticated request.
    Ok(reqwest_middleware::ClientBuilder::new(http)
        .with(RetryTransientMiddleware::new_with_policy_and_strategy(
            retry_policy(&config.retry_config),
            TunnelAwareStrategy,
        ))
        .with(ProxyAuthMiddleware::new(Arc::clone(policy)))
        .build())
}

/// Retries what `reqwest-retry` considers transient, except a rejected
/// tunnel: the same token would be rejected again.
struct TunnelAwareStrategy;

impl RetryableStrategy for TunnelAwareStrategy {
    fn handle(&self, res: &Result<Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(response) => default_on_request_success(response),
            Err(err) if is_tunnel_rejection(err) => Some(Retryable::Fatal),
            Err(err) => default_on_request_failure(err),
        }
    }
}

/// Transient-failure backoff for `retry`. Validation guarantees a finite
/// multiplier of at least 1.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn retry_policy(retry: &RetryConfig) -> ExponentialBackoff {
    let base = retry.backoff_multiplier.round().clamp(1.0, f64::from(u32::MAX)) as u32;
    let jitter = if retry.jitter {
        Jitter::Bounded
    } else {
        Jitter::None
    };
    ExponentialBackoff::builder()
        .retry_bounds(retry.initial_delay, retry.max_delay)
        .base(base)
        .jitter(jitter)
        .build_with_max_retries(retry.max_retries)
}

impl fmt::Debug for ProxiedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxiedClient")
            .field("proxy", &self.config.proxy_url())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use base64::Engine as _;
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use kerbproxy_common::TokenEncoding;
    use reqwest::StatusCode;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::testing::{FailAt, FakeProvider};

    fn config_for(server: &MockServer) -> ProxyAuthConfig {
        let address = server.address();
        ProxyAuthConfig::new(address.ip().to_string())
            .with_proxy_port(address.port())
            .with_retry_config(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            })
    }

    async fn mount_proxy(server: &MockServer, expected: String) {
        Mock::given(method("GET"))
            .and(header("Proxy-Authorization", expected.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("through the proxy"))
            .with_priority(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(407).insert_header("Proxy-Authenticate", "Negotiate"),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn routes_through_proxy_and_authenticates() {
        let server = MockServer::start().await;
        let token = format!("token-for:HTTP/{}", server.address().ip());
        mount_proxy(&server, format!("Negotiate {}", STANDARD_NO_PAD.encode(&token))).await;

        let provider = Arc::new(FakeProvider::new());
        let client = ProxiedClient::new(
            config_for(&server),
            Arc::clone(&provider) as Arc<dyn SecurityProvider>,
        )
        .unwrap();

        let response = client.get("http://www.example.com/").send().await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "through the proxy");
        assert_eq!(provider.steps(), 1);
    }

    #[tokio::test]
    async fn padded_encoding_is_configurable() {
        let server = MockServer::start().await;
        let token = format!("token-for:proxy/{}", server.address().ip());
        let expected = format!("Negotiate {}", STANDARD.encode(&token));
        assert!(expected.ends_with('='));
        mount_proxy(&server, expected).await;

        let mut config = config_for(&server).with_token_encoding(TokenEncoding::Padded);
        config.service_type = "proxy".to_string();
        let client = ProxiedClient::new(config, Arc::new(FakeProvider::new())).unwrap();

        let response = client.get("http://www.example.com/").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn negotiation_failure_is_an_authentication_error() {
        let server = MockServer::start().await;
        mount_proxy(&server, "Negotiate unused".to_string()).await;

        let client = ProxiedClient::new(
            config_for(&server),
            Arc::new(FakeProvider::failing(FailAt::Name)),
        )
        .unwrap();

        let err = client.get("http://www.example.com/").send().await.unwrap_err();
        assert!(ClientError::from(err).is_authentication_error());
    }

    #[tokio::test]
    async fn clients_share_a_registry() {
        let server = MockServer::start().await;
        let token = format!("token-for:HTTP/{}", server.address().ip());
        mount_proxy(&server, format!("Negotiate {}", STANDARD_NO_PAD.encode(&token))).await;

        let config = config_for(&server);
        let registry = Arc::new(EngineRegistry::new(Arc::new(FakeProvider::new())));
        let first = ProxiedClient::with_registry(config.clone(), Arc::clone(&registry)).unwrap();
        let second = ProxiedClient::with_registry(config, Arc::clone(&registry)).unwrap();

        first.get("http://www.example.com/a").send().await.unwrap();
        second.get("http://www.example.com/b").send().await.unwrap();

        assert_eq!(registry.engines_created(), 1);
        assert!(Arc::ptr_eq(first.policy().registry(), second.policy().registry()));
    }

    #[test]
    fn retry_policy_follows_retry_config() {
        let policy = retry_policy(&RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 3.0,
            jitter: false,
        });
        assert_eq!(policy.max_n_retries, Some(5));
        assert_eq!(policy.min_retry_interval, Duration::from_millis(100));
        assert_eq!(policy.max_retry_interval, Duration::from_secs(10));
        assert_eq!(policy.base, 3);
        assert_eq!(policy.jitter, Jitter::None);

        let policy = retry_policy(&RetryConfig::default());
        assert_eq!(policy.base, 2);
        assert_eq!(policy.jitter, Jitter::Bounded);
    }

    #[test]
    fn rejected_tunnels_are_not_retried() {
        let rejected = Err(reqwest_middleware::Error::middleware(std::io::Error::other(
            "proxy authorization required",
        )));
        assert!(matches!(
            TunnelAwareStrategy.handle(&rejected),
            Some(Retryable::Fatal)
        ));
    }

    async fn mount_tunnel_proxy(server: &MockServer) {
        Mock::given(method("CONNECT"))
            .respond_with(
                ResponseTemplate::new(407).insert_header("Proxy-Authenticate", "Negotiate"),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn tunnels_carry_a_negotiated_token() {
        let server = MockServer::start().await;
        mount_tunnel_proxy(&server).await;

        let provider = Arc::new(FakeProvider::new());
        let client = ProxiedClient::new(
            config_for(&server),
            Arc::clone(&provider) as Arc<dyn SecurityProvider>,
        )
        .unwrap();

        let err = client.get_tunnelled("https://tunnel.example.com/").await.unwrap_err();
        assert!(err.is_tunnel_rejected());

        // One token up front, one fresh token after the rejection.
        assert_eq!(provider.steps(), 2);
        let connects: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|request| request.method.as_str() == "CONNECT")
            .collect();
        assert_eq!(connects.len(), 2);
        let token = format!("token-for:HTTP/{}", server.address().ip());
        let expected = format!("Negotiate {}", STANDARD_NO_PAD.encode(&token));
        for connect in &connects {
            assert_eq!(connect.headers.get("Proxy-Authorization").unwrap(), expected.as_str());
        }
    }

    #[tokio::test]
    async fn tunnel_token_is_reused_until_rejected() {
        let server = MockServer::start().await;
        let provider = Arc::new(FakeProvider::new());
        let client = ProxiedClient::new(
            config_for(&server),
            Arc::clone(&provider) as Arc<dyn SecurityProvider>,
        )
        .unwrap();

        client.tunnel_client(false).await.unwrap();
        client.clone().tunnel_client(false).await.unwrap();
        assert_eq!(provider.steps(), 1);

        client.tunnel_client(true).await.unwrap();
        assert_eq!(provider.steps(), 2);
    }

    #[tokio::test]
    async fn tunnel_authorization_failure_is_an_authentication_error() {
        let server = MockServer::start().await;
        let client = ProxiedClient::new(
            config_for(&server),
            Arc::new(FakeProvider::failing(FailAt::Name)),
        )
        .unwrap();

        let err = client.tunnel_authorization().await.unwrap_err();
        assert!(err.is_authentication_error());
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ProxyAuthConfig::new("");
        let err = ProxiedClient::new(config, Arc::new(FakeProvider::new())).unwrap_err();
        assert!(matches!(err, ClientError::ConfigurationError(_)));
    }
}
