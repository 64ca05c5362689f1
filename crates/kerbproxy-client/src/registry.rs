//! Cache of token engines keyed by configuration fingerprint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use log::info;

use kerbproxy_common::{ConfigurationFingerprint, LoginConfig, ProxyAuthConfig};

use crate::engine::{EngineSettings, TokenEngine};
use crate::mechanism::SecurityProvider;

/// Maps configuration fingerprints to token engines.
///
/// The registry is an ordinary value: build one at client start-up and share
/// it through an `Arc` with every policy that should reuse security contexts.
/// Entries are never removed, so a registry holds at most one engine per
/// fingerprint for its whole lifetime.
pub struct EngineRegistry {
    provider: Arc<dyn SecurityProvider>,
    settings: EngineSettings,
    /// Uses `DashMap` so lookups of existing engines never contend
    engines: DashMap<ConfigurationFingerprint, Arc<TokenEngine>>,
    engines_created: AtomicUsize,
}

impl EngineRegistry {
    /// Creates an empty registry whose engines use `provider` and default
    /// settings.
    pub fn new(provider: Arc<dyn SecurityProvider>) -> Self {
        Self::with_settings(provider, EngineSettings::default())
    }

    /// Creates an empty registry with explicit engine settings.
    pub fn with_settings(provider: Arc<dyn SecurityProvider>, settings: EngineSettings) -> Self {
        Self {
            provider,
            settings,
            engines: DashMap::new(),
            engines_created: AtomicUsize::new(0),
        }
    }

    /// Creates an empty registry with engine settings taken from `config`.
    pub fn from_config(provider: Arc<dyn SecurityProvider>, config: &ProxyAuthConfig) -> Self {
        let settings = EngineSettings::builder()
            .service_type(config.service_type.clone())
            .mechanism(config.mechanism)
            .token_encoding(config.token_encoding)
            .build();
        Self::with_settings(provider, settings)
    }

    /// Returns the engine for the fingerprint of `login_config` and
    /// `context_name`, creating it bound to `service_name` on first use.
    ///
    /// Engines are keyed by fingerprint alone: a later call with the same
    /// fingerprint and a different service name gets the existing engine.
    pub fn resolve(
        &self,
        service_name: &str,
        login_config: &LoginConfig,
        context_name: Option<&str>,
    ) -> Arc<TokenEngine> {
        let fingerprint = ConfigurationFingerprint::compute(login_config, context_name);
        self.resolve_fingerprint(service_name, fingerprint)
    }

    /// Like [`EngineRegistry::resolve`] for an already computed fingerprint.
    pub fn resolve_fingerprint(
        &self,
        service_name: &str,
        fingerprint: ConfigurationFingerprint,
    ) -> Arc<TokenEngine> {
        if let Some(engine) = self.engines.get(&fingerprint) {
            return Arc::clone(engine.value());
        }

        // The entry guard holds the shard write lock, so concurrent misses on
        // one fingerprint construct a single engine.
        let entry = self.engines.entry(fingerprint.clone()).or_insert_with(|| {
            self.engines_created.fetch_add(1, Ordering::SeqCst);
            info!("creating token engine for {service_name} (fingerprint {fingerprint})");
            Arc::new(TokenEngine::new(
                service_name,
                fingerprint,
                self.settings.clone(),
                Arc::clone(&self.provider),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Number of cached engines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engine has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Number of engines constructed over the registry's lifetime.
    #[must_use]
    pub fn engines_created(&self) -> usize {
        self.engines_created.load(Ordering::SeqCst)
    }

    /// Settings applied to new engines.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("settings", &self.settings)
            .field("engines", &self.engines.len())
            .finish_non_exhaustive()
    }
}
