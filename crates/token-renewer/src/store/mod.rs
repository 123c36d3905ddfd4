//! Access to the external object store holding policies and credentials.
//!
//! The engine only needs point reads and read-modify-write updates with change
//! detection. Updates never create objects: a policy deleted mid-evaluation
//! must stay deleted, and store entries are always provisioned externally.

mod memory;

pub use memory::InMemoryStore;

use crate::model::{CredentialPolicy, Kind, ObjectKey, SecretEntry};
use token_renewer_tonic_core::Error as RpcError;

#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },

    /// The call was abandoned because its context expired or was cancelled.
    #[error("store call interrupted: {0}")]
    Interrupted(#[from] RpcError),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Mutation applied by [`ResourceStore::update_policy`].
pub type PolicyMutation<'a> = &'a (dyn Fn(&mut CredentialPolicy) + Send + Sync);

/// Mutation applied by [`ResourceStore::update_secret`].
pub type SecretMutation<'a> = &'a (dyn Fn(&mut SecretEntry) + Send + Sync);

#[tonic::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_policy(&self, key: &ObjectKey) -> Result<CredentialPolicy, StoreError>;

    async fn get_secret(&self, key: &ObjectKey) -> Result<SecretEntry, StoreError>;

    /// Applies `mutate` to the current policy and writes it back if anything
    /// changed. Returns whether a write happened.
    async fn update_policy(
        &self,
        key: &ObjectKey,
        mutate: PolicyMutation<'_>,
    ) -> Result<bool, StoreError>;

    /// Applies `mutate` to the current entry and writes it back if anything
    /// changed. Returns whether a write happened.
    async fn update_secret(
        &self,
        key: &ObjectKey,
        mutate: SecretMutation<'_>,
    ) -> Result<bool, StoreError>;

    /// Keys of every policy currently stored.
    async fn list_policies(&self) -> Result<Vec<ObjectKey>, StoreError>;
}

#[tonic::async_trait]
impl<T> ResourceStore for std::sync::Arc<T>
where
    T: ResourceStore + ?Sized,
{
    async fn get_policy(&self, key: &ObjectKey) -> Result<CredentialPolicy, StoreError> {
        (**self).get_policy(key).await
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<SecretEntry, StoreError> {
        (**self).get_secret(key).await
    }

    async fn update_policy(
        &self,
        key: &ObjectKey,
        mutate: PolicyMutation<'_>,
    ) -> Result<bool, StoreError> {
        (**self).update_policy(key, mutate).await
    }

    async fn update_secret(
        &self,
        key: &ObjectKey,
        mutate: SecretMutation<'_>,
    ) -> Result<bool, StoreError> {
        (**self).update_secret(key, mutate).await
    }

    async fn list_policies(&self) -> Result<Vec<ObjectKey>, StoreError> {
        (**self).list_policies().await
    }
}
