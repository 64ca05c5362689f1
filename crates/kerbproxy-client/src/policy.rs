//! Reaction to `407 Proxy Authentication Required`.
//!
//! The policy is stateless per request: whether a request has already been
//! answered is read from the request itself. A request that already carries
//! `Proxy-Authorization` was rejected with a token, so negotiating again would
//! only loop.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use reqwest::Request;
use reqwest::header::{HeaderValue, PROXY_AUTHORIZATION};
use tokio::sync::Semaphore;

use kerbproxy_common::{LoginConfig, ProxyAuthConfig};

use crate::engine::NegotiationToken;
use crate::error::{AuthenticationError, NegotiationError};
use crate::registry::EngineRegistry;

pub(crate) const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT_NEGOTIATIONS: usize = 4;

/// Where a request stands with respect to proxy authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// No credentials have been sent yet.
    Unchallenged,
    /// A token was already sent and the proxy still refused.
    ChallengeHandled,
}

impl ChallengeState {
    /// Reads the state from the request's headers.
    #[must_use]
    pub fn of(request: &Request) -> Self {
        if request.headers().contains_key(PROXY_AUTHORIZATION) {
            Self::ChallengeHandled
        } else {
            Self::Unchallenged
        }
    }
}

/// Answers proxy challenges with SPNEGO tokens.
#[derive(Debug, Clone)]
pub struct ProxyAuthenticationPolicy {
    proxy_host: String,
    registry: Arc<EngineRegistry>,
    login_config: LoginConfig,
    context_name: Option<String>,
    negotiation_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ProxyAuthenticationPolicy {
    /// Creates a policy for `proxy_host` with an empty login configuration.
    pub fn new(proxy_host: impl Into<String>, registry: Arc<EngineRegistry>) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            registry,
            login_config: LoginConfig::new(),
            context_name: None,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_NEGOTIATIONS)),
        }
    }

    /// Creates a policy from a validated configuration.
    pub fn from_config(config: &ProxyAuthConfig, registry: Arc<EngineRegistry>) -> Self {
        let policy = Self::new(config.proxy_host.clone(), registry)
            .with_login_config(config.login_config.clone())
            .with_timeout(config.negotiation_timeout())
            .with_max_concurrent_negotiations(config.max_concurrent_negotiations);
        match &config.context_name {
            Some(name) => policy.with_context_name(name.clone()),
            None => policy,
        }
    }

    /// Sets the login configuration that selects the engine.
    #[must_use]
    pub fn with_login_config(mut self, login_config: LoginConfig) -> Self {
        self.login_config = login_config;
        self
    }

    /// Sets the login context name that selects the engine.
    #[must_use]
    pub fn with_context_name(mut self, context_name: impl Into<String>) -> Self {
        self.context_name = Some(context_name.into());
        self
    }

    /// Sets the upper bound on a single negotiation, including the wait for a
    /// negotiation slot.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Sets how many negotiations may run on the blocking pool at once.
    #[must_use]
    pub fn with_max_concurrent_negotiations(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    /// Proxy host this policy authenticates to.
    #[must_use]
    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    /// Registry the policy draws engines from.
    #[must_use]
    pub const fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Handles a proxy challenge for `prior`.
    ///
    /// Returns `Ok(None)` to give up when `prior` already carried
    /// credentials; the caller should then surface the 407 unchanged.
    /// Otherwise returns `prior` with a fresh `Proxy-Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::Negotiation`] if no token could be
    /// produced. The original [`NegotiationError`] is kept as the source.
    pub async fn on_authentication_challenge(
        &self,
        mut prior: Request,
    ) -> Result<Option<Request>, AuthenticationError> {
        if ChallengeState::of(&prior) == ChallengeState::ChallengeHandled {
            warn!(
                "proxy {} rejected credentials for {}, giving up",
                self.proxy_host,
                prior.url()
            );
            return Ok(None);
        }

        let header = self.authorization_header().await?;
        prior.headers_mut().insert(PROXY_AUTHORIZATION, header);
        Ok(Some(prior))
    }

    /// Negotiates a token and renders it as a sensitive header value.
    ///
    /// # Errors
    ///
    /// See [`ProxyAuthenticationPolicy::on_authentication_challenge`].
    pub async fn authorization_header(&self) -> Result<HeaderValue, AuthenticationError> {
        let token = self.negotiate().await.map_err(|source| {
            error!("negotiation with proxy {} failed: {source}", self.proxy_host);
            AuthenticationError::Negotiation {
                proxy: self.proxy_host.clone(),
                source,
            }
        })?;

        let mut value = HeaderValue::from_str(&token.header_value())?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn negotiate(&self) -> Result<NegotiationToken, NegotiationError> {
        let engine = self.registry.resolve(
            &self.proxy_host,
            &self.login_config,
            self.context_name.as_deref(),
        );
        let permits = Arc::clone(&self.permits);

        let task = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| NegotiationError::Task(e.to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                engine.negotiate()
            })
            .await
            .map_err(|e| NegotiationError::Task(e.to_string()))?
        };

        tokio::time::timeout(self.negotiation_timeout, task)
            .await
            .map_err(|_| NegotiationError::Timeout(self.negotiation_timeout))?
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::error::Error as _;
    use std::sync::atomic::Ordering;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD_NO_PAD;

    use super::*;
    use crate::error::SecurityError;
    use crate::mechanism::SecurityProvider;
    use crate::testing::{FailAt, FakeProvider};

    fn request() -> Request {
        Request::new(
            reqwest::Method::GET,
            "http://www.google.com/".parse().unwrap(),
        )
    }

    fn policy(provider: FakeProvider) -> (Arc<FakeProvider>, ProxyAuthenticationPolicy) {
        let provider = Arc::new(provider);
        let registry = Arc::new(EngineRegistry::new(
            Arc::clone(&provider) as Arc<dyn SecurityProvider>
        ));
        (provider, ProxyAuthenticationPolicy::new("proxy.com", registry))
    }

    #[test]
    fn challenge_state_follows_header() {
        let mut request = request();
        assert_eq!(ChallengeState::of(&request), ChallengeState::Unchallenged);
        request
            .headers_mut()
            .insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Negotiate abc"));
        assert_eq!(ChallengeState::of(&request), ChallengeState::ChallengeHandled);
    }

    #[tokio::test]
    async fn attaches_negotiate_header() {
        let (provider, policy) = policy(FakeProvider::new());

        let retried = policy
            .on_authentication_challenge(request())
            .await
            .unwrap()
            .unwrap();

        let header = retried.headers().get(PROXY_AUTHORIZATION).unwrap();
        let expected = format!(
            "Negotiate {}",
            STANDARD_NO_PAD.encode("token-for:HTTP/proxy.com")
        );
        assert_eq!(header.to_str().unwrap(), expected);
        assert!(header.is_sensitive());
        assert_eq!(provider.steps(), 1);
        assert_eq!(retried.url().as_str(), "http://www.google.com/");
    }

    #[tokio::test]
    async fn gives_up_when_header_already_present() {
        let (provider, policy) = policy(FakeProvider::new());
        let mut prior = request();
        prior
            .headers_mut()
            .insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Negotiate abc"));

        let outcome = policy.on_authentication_challenge(prior).await.unwrap();

        assert!(outcome.is_none());
        assert!(policy.registry().is_empty());
        assert_eq!(provider.steps(), 0);
    }

    #[tokio::test]
    async fn negotiation_failure_is_typed_error() {
        let (_provider, policy) = policy(FakeProvider::failing(FailAt::Initiate));

        let err = policy
            .on_authentication_challenge(request())
            .await
            .unwrap_err();

        match &err {
            AuthenticationError::Negotiation { proxy, source } => {
                assert_eq!(proxy, "proxy.com");
                assert!(matches!(
                    source,
                    NegotiationError::Initiation {
                        source: SecurityError::Platform { .. },
                        ..
                    }
                ));
            }
            other => unreachable!("unexpected error {other:?}"),
        }
        assert!(err.source().is_some());
    }

    #[tokio::test]
    async fn slow_negotiation_times_out() {
        let (_provider, policy) =
            policy(FakeProvider::new().with_delay(Duration::from_millis(500)));
        let policy = policy.with_timeout(Duration::from_millis(50));

        let err = policy
            .on_authentication_challenge(request())
            .await
            .unwrap_err();

        assert!(err.negotiation().is_some_and(NegotiationError::is_timeout));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn negotiations_on_one_engine_are_serialized() {
        let (provider, policy) =
            policy(FakeProvider::new().with_delay(Duration::from_millis(20)));
        let policy = Arc::new(policy.with_max_concurrent_negotiations(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = Arc::clone(&policy);
                tokio::spawn(async move { policy.on_authentication_challenge(request()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }

        assert_eq!(provider.steps(), 8);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(policy.registry().engines_created(), 1);
    }

    #[tokio::test]
    async fn configured_context_name_selects_engine() {
        let provider = Arc::new(FakeProvider::new());
        let registry = Arc::new(EngineRegistry::new(
            Arc::clone(&provider) as Arc<dyn SecurityProvider>
        ));
        let config = ProxyAuthConfig::new("proxy.com").with_context_name("ctx-A");
        let policy = ProxyAuthenticationPolicy::from_config(&config, Arc::clone(&registry));

        policy.on_authentication_challenge(request()).await.unwrap();

        let engine = registry.resolve("proxy.com", &LoginConfig::new(), Some("ctx-A"));
        assert_eq!(engine.fingerprint().as_str(), "ctx-A");
        assert_eq!(registry.engines_created(), 1);
    }
}
