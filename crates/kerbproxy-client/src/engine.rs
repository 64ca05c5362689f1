//! SPNEGO token generation.
//!
//! A [`TokenEngine`] is bound to one proxy host and one configuration
//! fingerprint. Each call to [`TokenEngine::negotiate`] drives a single
//! client-initiated step toward `HTTP@<proxy host>` and returns the resulting
//! token. Calls on the same engine are serialized.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use log::debug;
use typed_builder::TypedBuilder;

use kerbproxy_common::{ConfigurationFingerprint, MechanismKind, TokenEncoding};
use kerbproxy_common::config::DEFAULT_SERVICE_TYPE;

use crate::error::NegotiationError;
use crate::mechanism::{
    ContextRequest, HostBasedService, Mechanism, SecurityContext, SecurityProvider,
};

/// Settings shared by every engine a registry creates.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineSettings {
    /// Service type of the host-based service name.
    #[builder(default = DEFAULT_SERVICE_TYPE.to_string(), setter(into))]
    pub service_type: String,
    /// Mechanism to negotiate.
    #[builder(default)]
    pub mechanism: MechanismKind,
    /// Header rendering of produced tokens.
    #[builder(default)]
    pub token_encoding: TokenEncoding,
    /// Flags for new security contexts.
    #[builder(default)]
    pub context_request: ContextRequest,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One round of the negotiation protocol.
#[derive(Clone, PartialEq, Eq)]
pub struct NegotiationToken {
    bytes: Vec<u8>,
    encoding: TokenEncoding,
}

impl NegotiationToken {
    /// Wraps raw token bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>, encoding: TokenEncoding) -> Self {
        Self { bytes, encoding }
    }

    /// The raw token.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The token in its header encoding, a single line of base64.
    #[must_use]
    pub fn encoded(&self) -> String {
        match self.encoding {
            TokenEncoding::Unpadded => STANDARD_NO_PAD.encode(&self.bytes),
            TokenEncoding::Padded => STANDARD.encode(&self.bytes),
        }
    }

    /// The full `Proxy-Authorization` value, `Negotiate <token>`.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("Negotiate {}", self.encoded())
    }
}

impl fmt::Debug for NegotiationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationToken")
            .field("len", &self.bytes.len())
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Owns the security context for one (proxy host, fingerprint) pair.
pub struct TokenEngine {
    service_name: String,
    fingerprint: ConfigurationFingerprint,
    settings: EngineSettings,
    provider: Arc<dyn SecurityProvider>,
    context: Mutex<Option<Box<dyn SecurityContext>>>,
}

impl TokenEngine {
    /// Creates an engine. Does no I/O; the context is created on first use.
    pub fn new(
        service_name: impl Into<String>,
        fingerprint: ConfigurationFingerprint,
        settings: EngineSettings,
        provider: Arc<dyn SecurityProvider>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            fingerprint,
            settings,
            provider,
            context: Mutex::new(None),
        }
    }

    /// Target host this engine authenticates to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Fingerprint this engine was registered under.
    #[must_use]
    pub const fn fingerprint(&self) -> &ConfigurationFingerprint {
        &self.fingerprint
    }

    /// Whether a security context has been established.
    #[must_use]
    pub fn has_context(&self) -> bool {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Produces a negotiation token for the target service.
    ///
    /// Blocks while the platform acquires tickets or contacts the KDC. Each call
    /// starts a fresh context: this is a single-leg negotiation and no
    /// continuation token ever comes back from the proxy.
    ///
    /// # Errors
    ///
    /// Returns a [`NegotiationError`] if the mechanism cannot be resolved, the
    /// service name cannot be canonicalized, credentials cannot be supplied, or
    /// context initiation fails.
    pub fn negotiate(&self) -> Result<NegotiationToken, NegotiationError> {
        let mut slot = self.context.lock().unwrap_or_else(PoisonError::into_inner);

        let requested = Mechanism::for_kind(self.settings.mechanism).map_err(|source| {
            NegotiationError::Configuration {
                mechanism: self.settings.mechanism.to_string(),
                source,
            }
        })?;
        let mechanism = self
            .provider
            .resolve_mechanism(&requested)
            .map_err(|source| NegotiationError::configuration(&requested, source))?;

        let service = HostBasedService::new(&self.settings.service_type, &self.service_name);
        let target = self
            .provider
            .canonicalize_name(&service, &mechanism)
            .map_err(|source| NegotiationError::NameResolution {
                name: service.to_string(),
                source,
            })?;

        // A failed step leaves no half-initialized context behind.
        *slot = None;
        let mut context = self
            .provider
            .create_context(&target, &mechanism, self.settings.context_request)
            .map_err(|source| NegotiationError::initiation(&target, source))?;
        let output = context
            .initiate_step(&[])
            .map_err(|source| NegotiationError::initiation(&target, source))?;
        *slot = Some(context);

        if output.is_empty() {
            return Err(NegotiationError::EmptyToken(target));
        }

        debug!(
            "issued {} byte {mechanism} token for {target} (fingerprint {})",
            output.len(),
            self.fingerprint
        );
        Ok(NegotiationToken::new(output, self.settings.token_encoding))
    }
}

impl fmt::Debug for TokenEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEngine")
            .field("service_name", &self.service_name)
            .field("fingerprint", &self.fingerprint)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::Ordering;

    use base64::Engine as _;

    use super::*;
    use crate::error::{CredentialError, SecurityError};
    use crate::testing::{FailAt, FakeProvider};

    fn engine(provider: &Arc<FakeProvider>, settings: EngineSettings) -> TokenEngine {
        TokenEngine::new(
            "proxy.com",
            ConfigurationFingerprint::empty(),
            settings,
            Arc::clone(provider) as Arc<dyn SecurityProvider>,
        )
    }

    #[test]
    fn negotiates_with_spnego_toward_http_service() {
        let provider = Arc::new(FakeProvider::new());
        let engine = engine(&provider, EngineSettings::default());
        assert!(!engine.has_context());

        let token = engine.negotiate().unwrap();

        assert_eq!(token.as_bytes(), b"token-for:HTTP/proxy.com");
        assert!(engine.has_context());
        let calls = provider.calls();
        assert_eq!(calls.mechanism.as_deref(), Some("1.3.6.1.5.5.2(1.2.840.113554.1.2.2)"));
        assert_eq!(calls.service_name.as_deref(), Some("HTTP@proxy.com"));
        assert_eq!(calls.request, Some(ContextRequest::proxy_default()));
        assert_eq!(calls.input_lengths, vec![0]);
    }

    #[test]
    fn token_encodings() {
        let token = NegotiationToken::new(b"ab".to_vec(), TokenEncoding::Unpadded);
        assert_eq!(token.encoded(), "YWI");
        assert_eq!(token.header_value(), "Negotiate YWI");

        let padded = NegotiationToken::new(b"ab".to_vec(), TokenEncoding::Padded);
        assert_eq!(padded.encoded(), STANDARD.encode(b"ab"));
        assert_eq!(padded.encoded(), "YWI=");
    }

    #[test]
    fn long_tokens_stay_on_one_line() {
        let token = NegotiationToken::new(vec![0xA5; 2048], TokenEncoding::Padded);
        assert!(!token.encoded().contains('\n'));
    }

    #[test]
    fn custom_service_type_and_mechanism() {
        let provider = Arc::new(FakeProvider::new());
        let settings = EngineSettings::builder()
            .service_type("host")
            .mechanism(MechanismKind::Kerberos)
            .build();

        let token = engine(&provider, settings).negotiate().unwrap();

        assert_eq!(token.as_bytes(), b"token-for:host/proxy.com");
        assert_eq!(provider.calls().mechanism.as_deref(), Some("1.2.840.113554.1.2.2"));
    }

    #[test]
    fn mechanism_failure_is_configuration_error() {
        let provider = Arc::new(FakeProvider::failing(FailAt::Mechanism));
        let err = engine(&provider, EngineSettings::default()).negotiate().unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Configuration {
                source: SecurityError::UnsupportedMechanism(_),
                ..
            }
        ));
    }

    #[test]
    fn name_failure_is_name_resolution_error() {
        let provider = Arc::new(FakeProvider::failing(FailAt::Name));
        let err = engine(&provider, EngineSettings::default()).negotiate().unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::NameResolution { ref name, .. } if name == "HTTP@proxy.com"
        ));
    }

    #[test]
    fn initiation_failure_keeps_cause_and_drops_context() {
        let provider = Arc::new(FakeProvider::failing(FailAt::Initiate));
        let engine = engine(&provider, EngineSettings::default());

        let err = engine.negotiate().unwrap_err();

        assert!(matches!(
            err,
            NegotiationError::Initiation {
                source: SecurityError::Platform { .. },
                ..
            }
        ));
        assert!(!engine.has_context());
    }

    #[test]
    fn credential_failure_is_credential_error() {
        let provider = Arc::new(FakeProvider::failing(FailAt::Credentials));
        let err = engine(&provider, EngineSettings::default()).negotiate().unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Credential(CredentialError::UnsupportedRequest(_))
        ));
    }

    #[test]
    fn empty_output_is_rejected() {
        let provider = Arc::new(FakeProvider::failing(FailAt::EmptyToken));
        let err = engine(&provider, EngineSettings::default()).negotiate().unwrap_err();
        assert!(matches!(err, NegotiationError::EmptyToken(_)));
    }

    #[test]
    fn every_call_creates_a_fresh_context() {
        let provider = Arc::new(FakeProvider::new());
        let engine = engine(&provider, EngineSettings::default());

        engine.negotiate().unwrap();
        engine.negotiate().unwrap();

        assert_eq!(provider.contexts_created.load(Ordering::SeqCst), 2);
        assert_eq!(provider.calls().input_lengths, vec![0, 0]);
    }
}
