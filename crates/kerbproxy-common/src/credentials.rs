use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// A principal name together with its secret.
///
/// This is the pair handed to the security mechanism when it has no cached
/// ticket and asks for credentials. The secret is held in a [`SecretString`]
/// and is redacted from `Debug` output.
#[derive(Clone)]
pub struct PrincipalCredentials {
    principal: String,
    secret: SecretString,
}

impl PrincipalCredentials {
    /// Creates a credential pair.
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Creates a credential pair from an already protected secret.
    pub fn from_secret(principal: impl Into<String>, secret: SecretString) -> Self {
        Self {
            principal: principal.into(),
            secret,
        }
    }

    /// The principal name, e.g. `user` or `user@EXAMPLE.COM`.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The protected secret.
    #[must_use]
    pub const fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Whether the secret is the empty string.
    #[must_use]
    pub fn has_empty_secret(&self) -> bool {
        self.secret.expose_secret().is_empty()
    }
}

impl fmt::Debug for PrincipalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalCredentials")
            .field("principal", &self.principal)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
