//! Fake security provider for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kerbproxy_common::PrincipalCredentials;

use crate::credentials::{CredentialRequest, CredentialSupplier, StaticCredentialSupplier};
use crate::error::SecurityError;
use crate::mechanism::{
    CanonicalName, ContextRequest, HostBasedService, Mechanism, SecurityContext, SecurityProvider,
};

/// Stage at which the fake provider fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Mechanism,
    Name,
    Initiate,
    Credentials,
    EmptyToken,
}

/// What the provider was asked to do, last call wins.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub mechanism: Option<String>,
    pub service_name: Option<String>,
    pub request: Option<ContextRequest>,
    pub input_lengths: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    fail_at: Option<FailAt>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Calls>>,
    pub contexts_created: AtomicUsize,
    pub steps: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(fail_at: FailAt) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::default()
        }
    }

    /// Makes every initiation step sleep for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl SecurityProvider for FakeProvider {
    fn resolve_mechanism(&self, mechanism: &Mechanism) -> Result<Mechanism, SecurityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.mechanism = Some(mechanism.to_string());
        }
        if self.fail_at == Some(FailAt::Mechanism) {
            return Err(SecurityError::UnsupportedMechanism(mechanism.to_string()));
        }
        Ok(mechanism.clone())
    }

    fn canonicalize_name(
        &self,
        name: &HostBasedService,
        _mechanism: &Mechanism,
    ) -> Result<CanonicalName, SecurityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.service_name = Some(name.to_string());
        }
        if self.fail_at == Some(FailAt::Name) {
            return Err(SecurityError::InvalidName(name.to_string()));
        }
        Ok(CanonicalName::new(format!("{}/{}", name.service(), name.host())))
    }

    fn create_context(
        &self,
        target: &CanonicalName,
        _mechanism: &Mechanism,
        request: ContextRequest,
    ) -> Result<Box<dyn SecurityContext>, SecurityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.request = Some(request);
        }
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            target: target.clone(),
            fail_at: self.fail_at,
            delay: self.delay,
            calls: Arc::clone(&self.calls),
            steps: Arc::clone(&self.steps),
            in_flight: Arc::clone(&self.in_flight),
            max_in_flight: Arc::clone(&self.max_in_flight),
        }))
    }
}

struct FakeContext {
    target: CanonicalName,
    fail_at: Option<FailAt>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Calls>>,
    steps: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SecurityContext for FakeContext {
    fn initiate_step(&mut self, input: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.steps.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.input_lengths.push(input.len());
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.fail_at {
            Some(FailAt::Initiate) => Err(SecurityError::platform_with_source(
                "no usable ticket",
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "KDC unreachable"),
            )),
            Some(FailAt::Credentials) => {
                let supplier =
                    StaticCredentialSupplier::new(PrincipalCredentials::new("user", "pass"));
                let mut requests = vec![
                    CredentialRequest::name("username"),
                    CredentialRequest::other("choice"),
                ];
                supplier.supply(&mut requests)?;
                Ok(Vec::new())
            }
            Some(FailAt::EmptyToken) => Ok(Vec::new()),
            _ => Ok(format!("token-for:{}", self.target).into_bytes()),
        }
    }
}
