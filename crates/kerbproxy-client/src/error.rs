//! Error types for proxy negotiation.
//!
//! Errors nest from the platform outwards: a [`SecurityError`] from the
//! security subsystem becomes the `source` of a [`NegotiationError`] raised by
//! a token engine, which in turn becomes the `source` of the
//! [`AuthenticationError`] handed to the transport. The original cause is
//! always reachable through [`std::error::Error::source`].

use std::time::Duration;

use thiserror::Error;

use crate::mechanism::{CanonicalName, Mechanism};

/// Boxed error from a platform binding.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the credential callback.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The mechanism asked for something other than a name or a secret.
    ///
    /// Signals a mismatch between the mechanism and this supplier.
    #[error("Unsupported credential request: {0}")]
    UnsupportedRequest(String),

    /// No credentials are configured to answer the request.
    #[error("No credentials configured for {0}")]
    Missing(String),
}

/// Errors reported by a [`SecurityProvider`](crate::mechanism::SecurityProvider)
/// or [`SecurityContext`](crate::mechanism::SecurityContext).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecurityError {
    /// An object identifier is not valid dotted-decimal.
    #[error("Malformed mechanism identifier: {0:?}")]
    MalformedOid(String),

    /// The mechanism is not available on this platform.
    #[error("Unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    /// The target name is not acceptable.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The credential callback failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The platform reported a failure.
    #[error("{message}")]
    Platform {
        /// Human-readable description.
        message: String,
        /// Underlying platform error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl SecurityError {
    /// Creates a platform error without an underlying cause.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a platform error wrapping `source`.
    pub fn platform_with_source(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Platform {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Errors raised by a [`TokenEngine`](crate::engine::TokenEngine) while
/// producing a token.
///
/// None of these are retried by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NegotiationError {
    /// The mechanism is missing or malformed.
    #[error("Mechanism {mechanism} is not available")]
    Configuration {
        /// Mechanism that was requested.
        mechanism: String,
        /// Underlying cause.
        #[source]
        source: SecurityError,
    },

    /// The target service name could not be canonicalized.
    #[error("Cannot canonicalize service name {name}")]
    NameResolution {
        /// The host-based service name, e.g. `HTTP@proxy.com`.
        name: String,
        /// Underlying cause.
        #[source]
        source: SecurityError,
    },

    /// The credential callback could not answer the mechanism.
    #[error("Credential error: {0}")]
    Credential(#[source] CredentialError),

    /// Context creation or initiation failed.
    #[error("Security context initiation toward {target} failed")]
    Initiation {
        /// Canonical target name.
        target: CanonicalName,
        /// Underlying cause.
        #[source]
        source: SecurityError,
    },

    /// Initiation succeeded but produced no token.
    #[error("Security context toward {0} produced an empty token")]
    EmptyToken(CanonicalName),

    /// Negotiation did not finish in time.
    #[error("Negotiation did not complete within {0:?}")]
    Timeout(Duration),

    /// The negotiation task was cancelled or panicked.
    #[error("Negotiation task failed: {0}")]
    Task(String),
}

impl NegotiationError {
    pub(crate) fn configuration(mechanism: &Mechanism, source: SecurityError) -> Self {
        Self::Configuration {
            mechanism: mechanism.to_string(),
            source,
        }
    }

    /// Maps a context failure, lifting credential callback failures out.
    pub(crate) fn initiation(target: &CanonicalName, source: SecurityError) -> Self {
        match source {
            SecurityError::Credential(err) => Self::Credential(err),
            source => Self::Initiation {
                target: target.clone(),
                source,
            },
        }
    }

    /// Whether the failure came from the negotiation deadline.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Fatal proxy authentication failure surfaced to the transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthenticationError {
    /// Negotiation with the proxy failed.
    #[error("SPNEGO negotiation for proxy {proxy} failed: {source}")]
    Negotiation {
        /// Proxy host being authenticated to.
        proxy: String,
        /// Underlying cause.
        #[source]
        source: NegotiationError,
    },

    /// The token could not be placed in a header.
    #[error("Invalid Proxy-Authorization header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

impl AuthenticationError {
    /// The negotiation failure behind this error, if any.
    pub const fn negotiation(&self) -> Option<&NegotiationError> {
        match self {
            Self::Negotiation { source, .. } => Some(source),
            Self::InvalidHeader(_) => None,
        }
    }
}

/// Errors that can occur when building a proxied client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Network or HTTP client construction failure.
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Middleware layer error.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    /// Client configuration issue.
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] kerbproxy_common::ConfigError),

    /// The configured mechanism identifiers are invalid.
    #[error("Mechanism error: {0}")]
    MechanismError(#[from] SecurityError),

    /// A token for a `CONNECT` tunnel could not be negotiated.
    #[error("Proxy authentication error: {0}")]
    AuthenticationError(#[from] AuthenticationError),
}

impl ClientError {
    /// Check if this error came from proxy authentication.
    pub fn is_authentication_error(&self) -> bool {
        match self {
            Self::MiddlewareError(reqwest_middleware::Error::Middleware(err)) => {
                err.downcast_ref::<AuthenticationError>().is_some()
            }
            Self::AuthenticationError(_) => true,
            _ => false,
        }
    }

    /// Check if the proxy answered a `CONNECT` with 407.
    pub fn is_tunnel_rejected(&self) -> bool {
        is_tunnel_rejection(self)
    }
}

// How hyper-util reports a 407 answer to `CONNECT`.
const TUNNEL_REJECTED: &str = "proxy authorization required";

/// Whether `err` or any of its causes is a `CONNECT` refused with 407.
pub(crate) fn is_tunnel_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.to_string().contains(TUNNEL_REJECTED) {
            return true;
        }
        current = err.source();
    }
    false
}
