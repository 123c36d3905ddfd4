use super::{PolicyMutation, ResourceStore, SecretMutation, StoreError};
use crate::model::{CredentialPolicy, Kind, ObjectKey, SecretEntry};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Versioned<T> {
    object: T,
    /// Incremented on every write that changed the object.
    generation: u64,
}

/// A process-local [`ResourceStore`].
///
/// Writes are detected by comparing the object before and after the mutation;
/// a mutation that changes nothing leaves the generation untouched.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    policies: RwLock<BTreeMap<ObjectKey, Versioned<CredentialPolicy>>>,
    secrets: RwLock<BTreeMap<ObjectKey, Versioned<SecretEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_policy(&self, policy: CredentialPolicy) {
        self.policies.write().insert(
            policy.key.clone(),
            Versioned {
                object: policy,
                generation: 1,
            },
        );
    }

    pub fn insert_secret(&self, secret: SecretEntry) {
        self.secrets.write().insert(
            secret.key.clone(),
            Versioned {
                object: secret,
                generation: 1,
            },
        );
    }

    pub fn remove_policy(&self, key: &ObjectKey) -> Option<CredentialPolicy> {
        self.policies.write().remove(key).map(|v| v.object)
    }

    pub fn remove_secret(&self, key: &ObjectKey) -> Option<SecretEntry> {
        self.secrets.write().remove(key).map(|v| v.object)
    }

    pub fn policy(&self, key: &ObjectKey) -> Option<CredentialPolicy> {
        self.policies.read().get(key).map(|v| v.object.clone())
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<SecretEntry> {
        self.secrets.read().get(key).map(|v| v.object.clone())
    }

    pub fn policy_generation(&self, key: &ObjectKey) -> Option<u64> {
        self.policies.read().get(key).map(|v| v.generation)
    }

    pub fn secret_generation(&self, key: &ObjectKey) -> Option<u64> {
        self.secrets.read().get(key).map(|v| v.generation)
    }
}

fn apply<T>(
    map: &RwLock<BTreeMap<ObjectKey, Versioned<T>>>,
    kind: Kind,
    key: &ObjectKey,
    mutate: &(dyn Fn(&mut T) + Send + Sync),
) -> Result<bool, StoreError>
where
    T: Clone + PartialEq,
{
    let mut map = map.write();
    let entry = map.get_mut(key).ok_or_else(|| StoreError::NotFound {
        kind,
        key: key.clone(),
    })?;

    let mut updated = entry.object.clone();
    mutate(&mut updated);
    if updated == entry.object {
        return Ok(false);
    }

    entry.object = updated;
    entry.generation += 1;
    Ok(true)
}

#[tonic::async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_policy(&self, key: &ObjectKey) -> Result<CredentialPolicy, StoreError> {
        self.policy(key).ok_or_else(|| StoreError::NotFound {
            kind: Kind::Policy,
            key: key.clone(),
        })
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<SecretEntry, StoreError> {
        self.secret(key).ok_or_else(|| StoreError::NotFound {
            kind: Kind::Secret,
            key: key.clone(),
        })
    }

    async fn update_policy(
        &self,
        key: &ObjectKey,
        mutate: PolicyMutation<'_>,
    ) -> Result<bool, StoreError> {
        apply(&self.policies, Kind::Policy, key, mutate)
    }

    async fn update_secret(
        &self,
        key: &ObjectKey,
        mutate: SecretMutation<'_>,
    ) -> Result<bool, StoreError> {
        apply(&self.secrets, Kind::Secret, key, mutate)
    }

    async fn list_policies(&self) -> Result<Vec<ObjectKey>, StoreError> {
        Ok(self.policies.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretEntry {
        SecretEntry::new(ObjectKey::new("default", "api")).with_value("token", "abc")
    }

    #[tokio::test]
    async fn identical_mutation_is_not_a_write() {
        let store = InMemoryStore::new();
        let s = secret();
        store.insert_secret(s.clone());

        let changed = store
            .update_secret(&s.key, &|e: &mut SecretEntry| {
                e.data.insert("token".into(), b"abc".to_vec());
            })
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.secret_generation(&s.key), Some(1));
    }

    #[tokio::test]
    async fn changed_mutation_bumps_generation() {
        let store = InMemoryStore::new();
        let s = secret();
        store.insert_secret(s.clone());

        let changed = store
            .update_secret(&s.key, &|e: &mut SecretEntry| {
                e.data.insert("token".into(), b"xyz".to_vec());
            })
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(store.secret_generation(&s.key), Some(2));
        assert_eq!(store.secret(&s.key).unwrap().data["token"], b"xyz");
    }

    #[tokio::test]
    async fn update_never_creates() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "ghost");
        let err = store
            .update_secret(&key, &|_: &mut SecretEntry| {})
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.secret(&key).is_none());
    }

    #[tokio::test]
    async fn removed_objects_are_not_found() {
        let store = InMemoryStore::new();
        let s = secret();
        store.insert_secret(s.clone());
        assert_eq!(store.remove_secret(&s.key), Some(s.clone()));
        assert!(store.get_secret(&s.key).await.unwrap_err().is_not_found());
        assert_eq!(store.remove_secret(&s.key), None);
    }
}
