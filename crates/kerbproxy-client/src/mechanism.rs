//! Capability interface over the platform security subsystem.
//!
//! The token engine never talks to GSS-API, SSPI or a KDC directly. It calls a
//! [`SecurityProvider`] to look up a mechanism, canonicalize the target name and
//! create a [`SecurityContext`], then drives one initiation step on that
//! context. Production code plugs in a platform binding; tests plug in a fake.

use std::fmt;
use std::str::FromStr;

use kerbproxy_common::MechanismKind;

use crate::error::SecurityError;

/// SPNEGO mechanism OID. See <https://oidref.com/1.3.6.1.5.5.2>
pub const SPNEGO_OID: &str = "1.3.6.1.5.5.2";

/// Kerberos V5 mechanism OID. See <https://oidref.com/1.2.840.113554.1.2.2>
pub const KRB5_OID: &str = "1.2.840.113554.1.2.2";

/// A mechanism object identifier in dotted-decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(String);

impl Oid {
    /// Returns the dotted-decimal representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Oid {
    type Err = SecurityError;

    /// Parses a dotted-decimal OID.
    ///
    /// An OID needs at least two arcs, every arc must be a decimal number, and
    /// the first arc must be 0, 1 or 2.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let arcs: Vec<&str> = s.split('.').collect();
        if arcs.len() < 2 {
            return Err(SecurityError::MalformedOid(s.to_string()));
        }
        if arcs
            .iter()
            .any(|arc| arc.is_empty() || !arc.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(SecurityError::MalformedOid(s.to_string()));
        }
        if !matches!(arcs[0], "0" | "1" | "2") {
            return Err(SecurityError::MalformedOid(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A security mechanism to negotiate.
///
/// For SPNEGO the `inner` OID names the mechanism SPNEGO wraps (Kerberos V5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mechanism {
    /// Mechanism the context is created with.
    pub oid: Oid,
    /// Mechanism negotiated inside SPNEGO, if any.
    pub inner: Option<Oid>,
}

impl Mechanism {
    /// Builds the mechanism for a configured kind.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::MalformedOid`] if an identifier does not parse.
    pub fn for_kind(kind: MechanismKind) -> Result<Self, SecurityError> {
        match kind {
            MechanismKind::Kerberos => Ok(Self {
                oid: KRB5_OID.parse()?,
                inner: None,
            }),
            _ => Ok(Self {
                oid: SPNEGO_OID.parse()?,
                inner: Some(KRB5_OID.parse()?),
            }),
        }
    }

    /// Whether this is SPNEGO.
    #[must_use]
    pub fn is_spnego(&self) -> bool {
        self.oid.as_str() == SPNEGO_OID
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "{}({inner})", self.oid),
            None => write!(f, "{}", self.oid),
        }
    }
}

/// A host-based service name, `<service>@<host>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostBasedService {
    service: String,
    host: String,
}

impl HostBasedService {
    /// Creates a host-based service name.
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
        }
    }

    /// The service type, e.g. `HTTP`.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for HostBasedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.host)
    }
}

/// A target name after canonicalization against a mechanism.
///
/// Opaque to the core; providers choose the representation (for Kerberos,
/// typically `HTTP/host.example.com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName(String);

impl CanonicalName {
    /// Wraps a provider-produced canonical name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifetime requested for a security context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContextLifetime {
    /// Whatever the platform picks.
    #[default]
    Default,
    /// An explicit lifetime in seconds.
    Seconds(u32),
}

/// Flags requested when creating a security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRequest {
    /// Ask the target to authenticate back to us.
    pub mutual_auth: bool,
    /// Forward our credentials to the target.
    pub delegate_credentials: bool,
    /// Requested context lifetime.
    pub lifetime: ContextLifetime,
}

impl ContextRequest {
    /// The request used for proxy authentication: mutual authentication, no
    /// delegation, default lifetime.
    #[must_use]
    pub const fn proxy_default() -> Self {
        Self {
            mutual_auth: true,
            delegate_credentials: false,
            lifetime: ContextLifetime::Default,
        }
    }
}

impl Default for ContextRequest {
    fn default() -> Self {
        Self::proxy_default()
    }
}

/// A platform security subsystem (GSS-API, SSPI, or a stand-in).
///
/// All methods may block. Callers run them off the async executor.
pub trait SecurityProvider: Send + Sync {
    /// Checks that `mechanism` is available and returns the form the provider
    /// will use for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism is unknown or unsupported.
    fn resolve_mechanism(&self, mechanism: &Mechanism) -> Result<Mechanism, SecurityError>;

    /// Canonicalizes a host-based service name against `mechanism`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be imported or canonicalized.
    fn canonicalize_name(
        &self,
        name: &HostBasedService,
        mechanism: &Mechanism,
    ) -> Result<CanonicalName, SecurityError>;

    /// Creates a fresh initiator context toward `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses to create the context.
    fn create_context(
        &self,
        target: &CanonicalName,
        mechanism: &Mechanism,
        request: ContextRequest,
    ) -> Result<Box<dyn SecurityContext>, SecurityError>;
}

/// An initiator-side security context.
pub trait SecurityContext: Send {
    /// Runs one step of context establishment.
    ///
    /// `input` is the token received from the peer, empty on the first step.
    /// May acquire or refresh a ticket, calling back into a
    /// [`CredentialSupplier`](crate::credentials::CredentialSupplier).
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails (no usable credentials, clock skew,
    /// unreachable KDC and so on).
    fn initiate_step(&mut self, input: &[u8]) -> Result<Vec<u8>, SecurityError>;
}
