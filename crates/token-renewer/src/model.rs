//! Objects read and written through the [`ResourceStore`](crate::ResourceStore).
//!
//! - [`CredentialPolicy`] - the user's intent to keep one credential renewed.
//! - [`SecretEntry`] - the key/value object holding the live credential.

use core::fmt;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Namespaced identity of a stored object, rendered as `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The two object kinds the engine reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Policy,
    Secret,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Policy => "policy",
            Self::Secret => "secret",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub key: ObjectKey,
    pub spec: PolicySpec,
    pub status: PolicyStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySpec {
    /// Name of the registered provider that knows how to renew this credential.
    pub provider_name: String,
    /// Opaque, provider-defined state. Rewritten after each renewal.
    pub metadata: String,
    /// How long before expiration the credential should be renewed.
    pub before_duration: Duration,
    /// Name of the [`SecretEntry`] in the same namespace.
    pub secret_ref: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyStatus {
    /// `None` until the provider has been asked.
    pub expiration_time: Option<SystemTime>,
}

impl CredentialPolicy {
    pub fn new(key: ObjectKey, spec: PolicySpec) -> Self {
        Self {
            key,
            spec,
            status: PolicyStatus::default(),
        }
    }

    /// Key of the store entry this policy points at.
    pub fn secret_key(&self) -> ObjectKey {
        ObjectKey::new(self.key.namespace.clone(), self.spec.secret_ref.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretEntry {
    pub key: ObjectKey,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretEntry {
    pub const fn new(key: ObjectKey) -> Self {
        Self {
            key,
            data: BTreeMap::new(),
        }
    }

    /// Builder-style insert, mostly for seeding and tests.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}
