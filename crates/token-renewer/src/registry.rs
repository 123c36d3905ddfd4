//! Name → provider mapping shared by the plugin server and the engine.
//!
//! The registry is a cheap-to-clone handle; every clone sees the same
//! entries. Transport teardown (failing a stream session's outstanding
//! calls) always happens after the lock has been released.

use crate::error::{Error, Result};
use crate::mux::Session;
use crate::provider::ProviderHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    providers: HashMap<String, ProviderHandle>,
    /// Set by [`Registry::drop_all`]; no registration is accepted afterwards.
    draining: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `name`, replacing any previous entry.
    ///
    /// A replaced stream session is torn down so its pending calls fail with
    /// a disconnect instead of waiting on a stream nobody routes to anymore.
    ///
    /// # Errors
    ///
    /// [`Error::RegistryClosed`] once [`drop_all`](Self::drop_all) has run.
    /// The offered handle is torn down in that case.
    pub fn register(&self, name: impl Into<String>, handle: ProviderHandle) -> Result<()> {
        let name = name.into();
        let transport = handle.transport();

        let replaced = {
            let mut inner = self.inner.write();
            if inner.draining {
                drop(inner);
                handle.teardown(&name);
                return Err(Error::RegistryClosed);
            }
            inner.providers.insert(name.clone(), handle)
        };

        if let Some(old) = replaced {
            tracing::info!(provider = %name, transport, "Replacing registered provider");
            old.teardown(&name);
        } else {
            tracing::info!(provider = %name, transport, "Registered provider");
        }
        Ok(())
    }

    /// Removes `name`, failing its in-flight calls with a disconnect.
    ///
    /// Returns whether an entry was removed; unknown names are a no-op.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.write().providers.remove(name);
        match removed {
            Some(handle) => {
                let failed = handle.teardown(name);
                tracing::info!(provider = name, failed, "Unregistered provider");
                true
            }
            None => false,
        }
    }

    /// Removes `name` only if it still refers to `session`.
    ///
    /// Used by a session on its way out, so that a provider which already
    /// reconnected under the same name keeps its new entry.
    pub fn unregister_session(&self, name: &str, session: &Arc<Session>) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let same = matches!(
                inner.providers.get(name),
                Some(ProviderHandle::Stream(p)) if Arc::ptr_eq(p.session(), session)
            );
            if same {
                inner.providers.remove(name)
            } else {
                None
            }
        };

        match removed {
            Some(handle) => {
                handle.teardown(name);
                tracing::info!(provider = name, "Unregistered closed session");
                true
            }
            None => false,
        }
    }

    /// Looks up a usable provider.
    ///
    /// # Errors
    ///
    /// - [`Error::RegistryClosed`] while shutting down.
    /// - [`Error::ProviderUnavailable`] if nothing is registered under
    ///   `name` or its session has already died.
    pub fn get(&self, name: &str) -> Result<ProviderHandle> {
        let inner = self.inner.read();
        if inner.draining {
            return Err(Error::RegistryClosed);
        }
        inner
            .providers
            .get(name)
            .filter(|handle| handle.is_alive())
            .cloned()
            .ok_or_else(|| Error::ProviderUnavailable {
                provider: name.to_string(),
            })
    }

    /// Removes and tears down every provider, and refuses further
    /// registrations.
    pub fn drop_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.write();
            inner.draining = true;
            inner.providers.drain().collect()
        };

        let count = drained.len();
        for (name, handle) in drained {
            handle.teardown(&name);
        }
        if count > 0 {
            tracing::info!(count, "Dropped all providers");
        }
        count
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().providers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().providers.len()
    }

    /// Calls currently waiting on stream sessions.
    pub fn outstanding_calls(&self) -> usize {
        self.inner
            .read()
            .providers
            .values()
            .map(|handle| match handle {
                ProviderHandle::Stream(p) => p.session().outstanding(),
                ProviderHandle::Unary(_) | ProviderHandle::Local(_) => 0,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.inner.read().draining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::provider::{Renewal, StreamProvider, TokenProvider};
    use core::time::Duration;
    use std::time::SystemTime;
    use token_renewer_tonic_core::{Error as RpcError, Result as RpcResult, proto::Registration};
    use tokio::sync::mpsc;

    struct Fixed(u64);

    #[tonic::async_trait]
    impl TokenProvider for Fixed {
        async fn renew_token(&self, _: &CallContext, _: &str, _: &str) -> RpcResult<Renewal> {
            Err(RpcError::Remote {
                message: "unsupported".into(),
            })
        }

        async fn get_token_validity(
            &self,
            _: &CallContext,
            _: &str,
            _: &str,
        ) -> RpcResult<SystemTime> {
            Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(self.0))
        }
    }

    fn session(name: &str) -> Arc<Session> {
        // The receiver is dropped; these sessions never carry a call.
        let (tx, _rx) = mpsc::channel(1);
        Session::new(
            Registration {
                name: name.into(),
                version: "v1".into(),
            },
            tx,
        )
    }

    fn stream(session: &Arc<Session>) -> ProviderHandle {
        ProviderHandle::Stream(StreamProvider::new(session.clone(), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = Registry::new();
        registry.register("p", ProviderHandle::local(Fixed(1))).unwrap();
        registry.register("p", ProviderHandle::local(Fixed(2))).unwrap();

        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let handle = registry.get("p").unwrap();
        assert_eq!(
            handle.get_token_validity(&ctx, "m", "t").await.unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(2)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replaced_session_is_torn_down() {
        let registry = Registry::new();
        let old = session("p");
        registry.register("p", stream(&old)).unwrap();
        registry.register("p", ProviderHandle::local(Fixed(1))).unwrap();
        assert!(old.is_closed());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        registry.register("p", ProviderHandle::local(Fixed(1))).unwrap();
        assert!(registry.unregister("p"));
        assert!(!registry.unregister("p"));
        assert!(matches!(
            registry.get("p"),
            Err(Error::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn stale_session_cannot_evict_its_successor() {
        let registry = Registry::new();
        let old = session("p");
        let new = session("p");
        registry.register("p", stream(&old)).unwrap();
        registry.register("p", stream(&new)).unwrap();

        assert!(!registry.unregister_session("p", &old));
        assert!(registry.get("p").is_ok());

        assert!(registry.unregister_session("p", &new));
        assert!(registry.is_empty());
    }

    #[test]
    fn dead_session_is_unavailable() {
        let registry = Registry::new();
        let s = session("p");
        registry.register("p", stream(&s)).unwrap();
        s.close(RpcError::SessionClosed {
            reason: "eof".into(),
        });
        assert!(matches!(
            registry.get("p"),
            Err(Error::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn drop_all_closes_the_registry() {
        let registry = Registry::new();
        let s = session("a");
        registry.register("a", stream(&s)).unwrap();
        registry.register("b", ProviderHandle::local(Fixed(1))).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(registry.drop_all(), 2);
        assert!(s.is_closed());
        assert!(registry.is_empty());

        let late = session("c");
        assert!(matches!(
            registry.register("c", stream(&late)),
            Err(Error::RegistryClosed)
        ));
        assert!(late.is_closed());
        assert!(matches!(registry.get("a"), Err(Error::RegistryClosed)));
    }
}
