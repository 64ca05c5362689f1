//! Proxy authentication configuration.
//!
//! Configuration is usually loaded from a TOML file.
//!
//! ## Example Configuration
//!
//! ```toml
//! proxy_host = "proxy.example.com"
//! proxy_port = 3128
//! principal = "user"
//! secret_env = "KERBPROXY_SECRET"
//! context_name = "spnego-client"
//! negotiation_timeout_secs = 15
//!
//! [login_config]
//! useTicketCache = "true"
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::credentials::PrincipalCredentials;
use crate::error::{ConfigError, Result};
use crate::fingerprint::{ConfigurationFingerprint, LoginConfig};

/// Environment variable consulted for the secret when none is configured inline.
pub const DEFAULT_SECRET_ENV: &str = "KERBPROXY_SECRET";

/// Service type used to build the host-based service name (`HTTP@host`).
pub const DEFAULT_SERVICE_TYPE: &str = "HTTP";

/// Which security mechanism the token engine negotiates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum MechanismKind {
    /// SPNEGO wrapping Kerberos V5. What HTTP `Negotiate` expects.
    #[default]
    Spnego,
    /// Raw Kerberos V5, for proxies that accept bare Kerberos tokens.
    Kerberos,
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spnego => write!(f, "spnego"),
            Self::Kerberos => write!(f, "kerberos"),
        }
    }
}

/// How a negotiation token is rendered into the header.
///
/// Both variants use the standard base64 alphabet on a single line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenEncoding {
    /// Base64 without `=` padding.
    #[default]
    Unpadded,
    /// Base64 with `=` padding, for proxies with strict decoders.
    Padded,
}

/// Configuration for retry behavior with exponential backoff.
///
/// Applies to transient transport failures, never to a failed negotiation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kerbproxy_common::RetryConfig;
///
/// let config = RetryConfig {
///     max_retries: 5,
///     initial_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(60),
///     backoff_multiplier: 2.0,
///     jitter: true,
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before failing.
    pub max_retries: u32,
    /// Initial delay before the first retry attempt.
    pub initial_delay: Duration,
    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0 for doubling).
    /// Rounded to a whole number when the retry policy is built.
    pub backoff_multiplier: f64,
    /// Whether to randomize each delay between `initial_delay` and the
    /// computed backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration for authenticating to a Kerberos-protected HTTP proxy.
///
/// # Security
///
/// The `secret` field is a `SecretString` and is never serialized.
///
/// # Examples
///
/// ```
/// use kerbproxy_common::ProxyAuthConfig;
///
/// let config = ProxyAuthConfig::new("proxy.example.com")
///     .with_proxy_port(8080)
///     .with_credentials("user", "pass")
///     .with_context_name("ctx-A");
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.fingerprint().as_str(), "ctx-A");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuthConfig {
    /// Proxy host name. Also the target of the `HTTP@<host>` service name.
    pub proxy_host: String,

    /// Proxy port (default: 3128)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Principal used when the platform has no cached ticket.
    #[serde(default)]
    pub principal: Option<String>,

    /// Inline secret for `principal`.
    ///
    /// Will not be serialized to prevent accidental exposure.
    #[serde(skip_serializing, default)]
    pub secret: Option<SecretString>,

    /// Environment variable holding the secret when `secret` is unset.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Non-default login configuration options.
    #[serde(default)]
    pub login_config: LoginConfig,

    /// Optional login context name, part of the engine fingerprint.
    #[serde(default)]
    pub context_name: Option<String>,

    /// Service type of the host-based service name (default: `HTTP`)
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Mechanism to negotiate (default: spnego)
    #[serde(default)]
    pub mechanism: MechanismKind,

    /// Header rendering of negotiation tokens (default: unpadded)
    #[serde(default)]
    pub token_encoding: TokenEncoding,

    /// Upper bound on a single negotiation, in seconds (default: 30)
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Negotiations allowed to run at once (default: 4)
    #[serde(default = "default_max_concurrent_negotiations")]
    pub max_concurrent_negotiations: usize,

    /// Overall request timeout in seconds. `None` means no timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Command run by the helper security provider.
    #[serde(default)]
    pub helper_command: Option<String>,

    /// Configuration for retry behavior with exponential backoff.
    #[serde(skip)]
    pub retry_config: RetryConfig,
}

const fn default_proxy_port() -> u16 {
    3128
}

fn default_secret_env() -> String {
    DEFAULT_SECRET_ENV.to_string()
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

const fn default_negotiation_timeout() -> u64 {
    30
}

const fn default_max_concurrent_negotiations() -> usize {
    4
}

impl ProxyAuthConfig {
    /// Creates a configuration for the given proxy host with all defaults.
    pub fn new(proxy_host: impl Into<String>) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port: default_proxy_port(),
            principal: None,
            secret: None,
            secret_env: default_secret_env(),
            login_config: LoginConfig::new(),
            context_name: None,
            service_type: default_service_type(),
            mechanism: MechanismKind::default(),
            token_encoding: TokenEncoding::default(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            max_concurrent_negotiations: default_max_concurrent_negotiations(),
            timeout_seconds: None,
            helper_command: None,
            retry_config: RetryConfig::default(),
        }
    }

    /// Sets the proxy port.
    #[must_use]
    pub const fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    /// Sets the principal and inline secret.
    #[must_use]
    pub fn with_credentials(
        mut self,
        principal: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.principal = Some(principal.into());
        self.secret = Some(SecretString::from(secret.into()));
        self
    }

    /// Sets the principal, leaving the secret to `secret_env`.
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Sets the environment variable consulted for the secret.
    #[must_use]
    pub fn with_secret_env(mut self, name: impl Into<String>) -> Self {
        self.secret_env = name.into();
        self
    }

    /// Adds one login configuration option.
    #[must_use]
    pub fn with_login_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.login_config.insert(key.into(), value.into());
        self
    }

    /// Sets the login context name.
    #[must_use]
    pub fn with_context_name(mut self, context_name: impl Into<String>) -> Self {
        self.context_name = Some(context_name.into());
        self
    }

    /// Sets the mechanism to negotiate.
    #[must_use]
    pub const fn with_mechanism(mut self, mechanism: MechanismKind) -> Self {
        self.mechanism = mechanism;
        self
    }

    /// Sets the header rendering of negotiation tokens.
    #[must_use]
    pub const fn with_token_encoding(mut self, encoding: TokenEncoding) -> Self {
        self.token_encoding = encoding;
        self
    }

    /// Sets the negotiation timeout in seconds.
    #[must_use]
    pub const fn with_negotiation_timeout(mut self, seconds: u64) -> Self {
        self.negotiation_timeout_secs = seconds;
        self
    }

    /// Sets how many negotiations may run at once.
    #[must_use]
    pub const fn with_max_concurrent_negotiations(mut self, permits: usize) -> Self {
        self.max_concurrent_negotiations = permits;
        self
    }

    /// Sets the overall request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Sets the helper command.
    #[must_use]
    pub fn with_helper_command(mut self, command: impl Into<String>) -> Self {
        self.helper_command = Some(command.into());
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist or cannot be read
    /// - Deserialization fails
    /// - Validation fails
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        log::debug!("loaded proxy auth configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The proxy host is empty or the port is 0
    /// - The service type is empty
    /// - The negotiation timeout or concurrency limit is 0
    /// - The secret environment variable name is empty
    /// - The retry backoff multiplier is below 1 or not finite
    pub fn validate(&self) -> Result<()> {
        if self.proxy_host.trim().is_empty() {
            return Err(ConfigError::Invalid("proxy_host must not be empty".to_string()));
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::Invalid("proxy_port must not be 0".to_string()));
        }
        if self.service_type.trim().is_empty() {
            return Err(ConfigError::Invalid("service_type must not be empty".to_string()));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_negotiations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_negotiations must be at least 1".to_string(),
            ));
        }
        if self.secret_env.trim().is_empty() {
            return Err(ConfigError::Invalid("secret_env must not be empty".to_string()));
        }
        let multiplier = self.retry_config.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be at least 1, got {multiplier}"
            )));
        }
        Ok(())
    }

    /// The proxy URL requests are routed through.
    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy_host, self.proxy_port)
    }

    /// The negotiation timeout as a `Duration`.
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// The fingerprint of this configuration's login options and context name.
    #[must_use]
    pub fn fingerprint(&self) -> ConfigurationFingerprint {
        ConfigurationFingerprint::compute(&self.login_config, self.context_name.as_deref())
    }

    /// Resolves the configured credentials from the process environment.
    ///
    /// # Errors
    ///
    /// See [`ProxyAuthConfig::resolve_credentials_with`].
    pub fn resolve_credentials(&self) -> Result<Option<PrincipalCredentials>> {
        self.resolve_credentials_with(|name| std::env::var(name).ok())
    }

    /// Resolves the configured credentials using `lookup` for environment values.
    ///
    /// Returns `None` when no principal is configured; the platform is then
    /// expected to have a cached ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if a principal is configured but neither an inline
    /// secret nor the `secret_env` variable provides one.
    pub fn resolve_credentials_with<F>(&self, lookup: F) -> Result<Option<PrincipalCredentials>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(principal) = self.principal.as_ref() else {
            return Ok(None);
        };

        if let Some(secret) = self.secret.as_ref() {
            return Ok(Some(PrincipalCredentials::from_secret(
                principal.clone(),
                secret.clone(),
            )));
        }

        let secret = lookup(&self.secret_env)
            .ok_or_else(|| ConfigError::MissingEnv(self.secret_env.clone()))?;
        Ok(Some(PrincipalCredentials::new(principal.clone(), secret)))
    }
}
