//! # kerbproxy-common
//!
//! Common types for authenticating HTTP clients to a Kerberos-protected proxy.
//!
//! This crate provides the pieces shared by the negotiation core and its
//! callers:
//! - Proxy authentication configuration, loadable from TOML
//! - Principal credentials with redacted secrets
//! - Configuration fingerprints identifying interchangeable token engines
//!
//! ## Example
//!
//! ```
//! use kerbproxy_common::{ConfigurationFingerprint, LoginConfig, ProxyAuthConfig};
//!
//! let config = ProxyAuthConfig::new("proxy.example.com")
//!     .with_login_option("useTicketCache", "true")
//!     .with_context_name("ctx-A");
//!
//! let mut login_config = LoginConfig::new();
//! login_config.insert("useTicketCache".to_string(), "true".to_string());
//!
//! assert_eq!(
//!     config.fingerprint(),
//!     ConfigurationFingerprint::compute(&login_config, Some("ctx-A")),
//! );
//! ```

/// Proxy authentication configuration.
///
/// Contains the proxy location, credential sources, login options and
/// negotiation limits.
pub mod config;
/// Principal credentials.
pub mod credentials;
pub mod error;
pub mod fingerprint;

pub use config::{MechanismKind, ProxyAuthConfig, RetryConfig, TokenEncoding};
pub use credentials::PrincipalCredentials;
pub use error::ConfigError;
pub use fingerprint::{ConfigurationFingerprint, LoginConfig};
