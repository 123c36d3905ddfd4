//! Error types for registry lookups and evaluations.
//!
//! Each variant maps to a stable event [`Reason`] through [`Error::reason`],
//! so callers can report failures without matching on messages.
//!
//! ## Error Cases
//! - `InvalidPolicy` / `MetadataEmpty`: the policy cannot be acted on.
//! - `ProviderUnavailable`: no live provider is registered under the name.
//! - `RegistryClosed`: the registry is draining for shutdown.
//! - `ValidityCheckFailed` / `RenewalFailed`: the provider call failed.
//! - `StoreKeyMissing` / `StoreValueEmpty` / `StoreValueNotUtf8`: the store
//!   entry does not hold a usable credential.
//! - `Store`: a read failed for a reason other than "not found".
//! - `PersistFailed`: a write failed after the provider already acted.

use crate::events::Reason;
use crate::model::{Kind, ObjectKey};
use crate::store::StoreError;
use token_renewer_tonic_core::Error as RpcError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Policy {key} is invalid: {reason}")]
    InvalidPolicy { key: ObjectKey, reason: String },

    #[error("Policy {key} has empty metadata")]
    MetadataEmpty { key: ObjectKey },

    #[error("Provider {provider} is not available")]
    ProviderUnavailable { provider: String },

    #[error("Provider registry is shutting down")]
    RegistryClosed,

    #[error("Unable to get token validity from {provider}: {source}")]
    ValidityCheckFailed {
        provider: String,
        #[source]
        source: RpcError,
    },

    #[error("Unable to renew token with {provider}: {source}")]
    RenewalFailed {
        provider: String,
        #[source]
        source: RpcError,
    },

    #[error("Secret {secret} is missing the `{key}` key")]
    StoreKeyMissing { secret: ObjectKey, key: String },

    #[error("Secret {secret} has an empty `{key}` value")]
    StoreValueEmpty { secret: ObjectKey, key: String },

    #[error("Secret {secret} `{key}` value is not valid UTF-8")]
    StoreValueNotUtf8 { secret: ObjectKey, key: String },

    #[error("Unable to fetch {kind} {key}: {source}")]
    Store {
        kind: Kind,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },

    #[error("Unable to update {kind} {key}: {source}")]
    PersistFailed {
        kind: Kind,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
}

impl Error {
    /// Stable event reason for this error.
    pub const fn reason(&self) -> Reason {
        match self {
            Self::InvalidPolicy { .. } => Reason::PolicyInvalid,
            Self::MetadataEmpty { .. } => Reason::MetadataEmpty,
            Self::ProviderUnavailable { .. } => Reason::ProviderNotFound,
            Self::RegistryClosed => Reason::RegistryClosed,
            Self::ValidityCheckFailed { .. } => Reason::TokenValidityError,
            Self::RenewalFailed { .. } => Reason::TokenRenewalError,
            Self::StoreKeyMissing { .. } => Reason::TokenKeyNotFound,
            Self::StoreValueEmpty { .. } => Reason::TokenEmpty,
            Self::StoreValueNotUtf8 { .. } => Reason::TokenInvalid,
            Self::Store { .. } => Reason::StoreReadError,
            Self::PersistFailed {
                kind: Kind::Secret,
                ..
            } => Reason::SecretUpdateError,
            Self::PersistFailed {
                kind: Kind::Policy,
                ..
            } => Reason::TokenUpdateError,
        }
    }

    /// Returns `true` for failures that happened after the provider already
    /// issued a new credential.
    pub const fn is_after_provider_action(&self) -> bool {
        matches!(self, Self::PersistFailed { .. })
    }
}
