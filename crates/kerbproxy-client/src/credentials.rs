//! Credential callback used by security mechanisms.
//!
//! When a mechanism has no cached ticket it asks for credentials through a list
//! of [`CredentialRequest`]s, each of which the [`CredentialSupplier`] fills in.

use std::fmt;

use kerbproxy_common::PrincipalCredentials;
use secrecy::SecretString;

use crate::error::CredentialError;

/// One piece of information a mechanism asks for.
pub enum CredentialRequest {
    /// Principal name request.
    Name {
        /// Prompt text supplied by the mechanism.
        prompt: String,
        /// Filled in by the supplier.
        value: Option<String>,
    },
    /// Secret (password) request.
    Secret {
        /// Prompt text supplied by the mechanism.
        prompt: String,
        /// Filled in by the supplier.
        value: Option<SecretString>,
    },
    /// Any other request kind, e.g. a confirmation or a choice.
    Other {
        /// Mechanism-specific kind of the request.
        kind: String,
    },
}

impl CredentialRequest {
    /// A name request with the given prompt.
    pub fn name(prompt: impl Into<String>) -> Self {
        Self::Name {
            prompt: prompt.into(),
            value: None,
        }
    }

    /// A secret request with the given prompt.
    pub fn secret(prompt: impl Into<String>) -> Self {
        Self::Secret {
            prompt: prompt.into(),
            value: None,
        }
    }

    /// A request of some other kind.
    pub fn other(kind: impl Into<String>) -> Self {
        Self::Other { kind: kind.into() }
    }

    /// Whether the supplier has filled in this request.
    #[must_use]
    pub const fn is_filled(&self) -> bool {
        match self {
            Self::Name { value, .. } => value.is_some(),
            Self::Secret { value, .. } => value.is_some(),
            Self::Other { .. } => false,
        }
    }
}

impl fmt::Debug for CredentialRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name { prompt, value } => f
                .debug_struct("Name")
                .field("prompt", prompt)
                .field("value", value)
                .finish(),
            Self::Secret { prompt, value } => f
                .debug_struct("Secret")
                .field("prompt", prompt)
                .field("value", &value.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            Self::Other { kind } => f.debug_struct("Other").field("kind", kind).finish(),
        }
    }
}

/// Answers credential requests from a security mechanism.
///
/// Invoked synchronously from inside context initiation, so implementations
/// must not block on the async runtime.
pub trait CredentialSupplier: Send + Sync {
    /// Fills in every request in `requests`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::UnsupportedRequest`] if any request is
    /// neither a name nor a secret request.
    fn supply(&self, requests: &mut [CredentialRequest]) -> Result<(), CredentialError>;
}

/// Supplier backed by one configured principal and secret.
#[derive(Debug, Clone)]
pub struct StaticCredentialSupplier {
    credentials: PrincipalCredentials,
}

impl StaticCredentialSupplier {
    /// Creates a supplier for the given credentials.
    #[must_use]
    pub const fn new(credentials: PrincipalCredentials) -> Self {
        Self { credentials }
    }
}

impl CredentialSupplier for StaticCredentialSupplier {
    fn supply(&self, requests: &mut [CredentialRequest]) -> Result<(), CredentialError> {
        for request in requests.iter_mut() {
            match request {
                CredentialRequest::Name { value, .. } => {
                    *value = Some(self.credentials.principal().to_string());
                }
                CredentialRequest::Secret { value, .. } => {
                    *value = Some(self.credentials.secret().clone());
                }
                CredentialRequest::Other { kind } => {
                    return Err(CredentialError::UnsupportedRequest(kind.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Supplier for deployments that rely on the platform ticket cache.
///
/// Answers every request with [`CredentialError::Missing`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialSupplier for NoCredentials {
    fn supply(&self, requests: &mut [CredentialRequest]) -> Result<(), CredentialError> {
        match requests.first() {
            None => Ok(()),
            Some(CredentialRequest::Other { kind }) => {
                Err(CredentialError::UnsupportedRequest(kind.clone()))
            }
            Some(
                CredentialRequest::Name { prompt, .. } | CredentialRequest::Secret { prompt, .. },
            ) => Err(CredentialError::Missing(prompt.clone())),
        }
    }
}
