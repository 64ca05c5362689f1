//! Configuration fingerprints.
//!
//! A fingerprint identifies which token engines are interchangeable: two
//! engines built from the same login configuration and context name can share
//! one security context.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Login configuration options, e.g. `useTicketCache = "true"`.
///
/// A `BTreeMap` keeps the entries sorted, so fingerprints do not depend on the
/// order in which options were inserted.
pub type LoginConfig = BTreeMap<String, String>;

/// Deterministic key derived from a login configuration and a context name.
///
/// Each configuration entry contributes `key=value;` in key order, followed by
/// the context name if there is one. Occurrences of `\\`, `=` and `;` inside
/// keys, values and the context name are escaped with a backslash, so distinct
/// inputs never share a fingerprint. The empty configuration with no context
/// name gives the empty fingerprint, and the empty configuration with context
/// name `ctx-A` gives exactly `ctx-A`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationFingerprint(String);

impl ConfigurationFingerprint {
    /// Computes the fingerprint for a configuration and optional context name.
    ///
    /// # Examples
    ///
    /// ```
    /// use kerbproxy_common::{ConfigurationFingerprint, LoginConfig};
    ///
    /// let fingerprint = ConfigurationFingerprint::compute(&LoginConfig::new(), Some("ctx-A"));
    /// assert_eq!(fingerprint.as_str(), "ctx-A");
    /// ```
    #[must_use]
    pub fn compute(config: &LoginConfig, context_name: Option<&str>) -> Self {
        let mut key = String::new();
        for (name, value) in config {
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, value);
            key.push(';');
        }
        if let Some(context_name) = context_name {
            push_escaped(&mut key, context_name);
        }
        Self(key)
    }

    /// The empty fingerprint.
    #[must_use]
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the empty fingerprint.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, '\\' | '=' | ';') {
            key.push('\\');
        }
        key.push(c);
    }
}

impl fmt::Display for ConfigurationFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
