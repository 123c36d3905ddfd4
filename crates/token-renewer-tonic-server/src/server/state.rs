//! JSON seed file for the in-memory store.
//!
//! ```json
//! {
//!   "policies": [{
//!     "namespace": "default",
//!     "name": "api",
//!     "providerName": "linode",
//!     "metadata": "{\"id\":42}",
//!     "beforeDurationSecs": 86400,
//!     "secretRef": "api-token"
//!   }],
//!   "secrets": [{
//!     "namespace": "default",
//!     "name": "api-token",
//!     "stringData": { "token": "..." }
//!   }]
//! }
//! ```

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
use token_renewer::{CredentialPolicy, InMemoryStore, ObjectKey, PolicySpec, SecretEntry};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateFile {
    #[serde(default)]
    pub policies: Vec<PolicyRecord>,
    #[serde(default)]
    pub secrets: Vec<SecretRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyRecord {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub provider_name: String,
    pub metadata: String,
    pub before_duration_secs: u64,
    pub secret_ref: String,
    /// Known expiration, if any. Left unset, the provider is asked first.
    #[serde(default)]
    pub expiration_unix_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecretRecord {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl From<PolicyRecord> for CredentialPolicy {
    fn from(r: PolicyRecord) -> Self {
        let mut policy = Self::new(
            ObjectKey::new(r.namespace, r.name),
            PolicySpec {
                provider_name: r.provider_name,
                metadata: r.metadata,
                before_duration: Duration::from_secs(r.before_duration_secs),
                secret_ref: r.secret_ref,
            },
        );
        policy.status.expiration_time = r
            .expiration_unix_secs
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        policy
    }
}

impl From<SecretRecord> for SecretEntry {
    fn from(r: SecretRecord) -> Self {
        r.string_data
            .into_iter()
            .fold(Self::new(ObjectKey::new(r.namespace, r.name)), |entry, (k, v)| {
                entry.with_value(k, v)
            })
    }
}

pub fn load(path: &Path) -> anyhow::Result<StateFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read state file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("unable to parse state file {}", path.display()))
}

/// Inserts every record into `store`. Returns `(policies, secrets)` counts.
pub fn seed(store: &InMemoryStore, state: StateFile) -> (usize, usize) {
    let counts = (state.policies.len(), state.secrets.len());
    for policy in state.policies {
        store.insert_policy(policy.into());
    }
    for secret in state.secrets {
        store.insert_secret(secret.into());
    }
    counts
}
