//! # token-renewer
//!
//! Keeps credentials renewed before they expire, using provider plugins that
//! speak gRPC.
//!
//! - [`Registry`] maps provider names to [`ProviderHandle`]s. Providers
//!   arrive either by socket discovery ([`discovery`]) or by dialing the
//!   controller's [`PluginStreamHandler`] and registering over a
//!   multiplexed stream ([`mux`]).
//! - [`RenewalEngine`] evaluates one [`CredentialPolicy`] at a time: it reads
//!   the current credential from a [`ResourceStore`], asks the provider for a
//!   replacement when the renewal window has opened, writes it back, and
//!   returns when to look again ([`Outcome`]).
//! - Every provider and store call is bounded by a [`CallContext`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::{Duration, SystemTime};
//! use token_renewer::{
//!     CallContext, CredentialPolicy, InMemoryStore, ObjectKey, Outcome, PolicySpec,
//!     ProviderHandle, Registry, Renewal, RenewalEngine, SecretEntry, TokenProvider,
//!     TracingEventSink,
//! };
//! use token_renewer_tonic_core::Result;
//!
//! struct Static;
//!
//! #[tonic::async_trait]
//! impl TokenProvider for Static {
//!     async fn renew_token(&self, _: &CallContext, _: &str, _: &str) -> Result<Renewal> {
//!         Ok(Renewal {
//!             token: "new".into(),
//!             metadata: String::new(),
//!             expiration: SystemTime::now() + Duration::from_secs(86_400),
//!         })
//!     }
//!
//!     async fn get_token_validity(&self, _: &CallContext, _: &str, _: &str) -> Result<SystemTime> {
//!         Ok(SystemTime::now())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Registry::new();
//! registry.register("static", ProviderHandle::local(Static)).unwrap();
//!
//! let store = Arc::new(InMemoryStore::new());
//! let key = ObjectKey::new("default", "api");
//! let mut policy = CredentialPolicy::new(
//!     key.clone(),
//!     PolicySpec {
//!         provider_name: "static".into(),
//!         metadata: "account=42".into(),
//!         before_duration: Duration::from_secs(3600),
//!         secret_ref: "api-secret".into(),
//!     },
//! );
//! policy.status.expiration_time = Some(SystemTime::now());
//! store.insert_policy(policy);
//! store.insert_secret(
//!     SecretEntry::new(ObjectKey::new("default", "api-secret")).with_value("token", "old"),
//! );
//!
//! let engine = RenewalEngine::new(store.clone(), TracingEventSink, registry);
//! let ctx = CallContext::with_timeout(Duration::from_secs(30));
//! let outcome = engine.evaluate(&key, &ctx).await.unwrap();
//! assert!(outcome.renewed());
//! # }
//! ```

mod context;
mod engine;
mod error;
mod events;
mod model;
mod registry;
mod schedule;
mod store;
mod time;

pub mod discovery;
pub mod mux;
pub mod plugin;
pub mod provider;

pub use crate::{
    context::CallContext,
    engine::RenewalEngine,
    error::{Error, Result},
    events::{Event, EventSink, MemoryEventSink, Reason, Severity, TracingEventSink},
    model::{CredentialPolicy, Kind, ObjectKey, PolicySpec, PolicyStatus, SecretEntry},
    mux::{PluginStreamHandler, Session, SessionConfig},
    provider::{ProviderHandle, Renewal, StreamProvider, TokenProvider, UnaryProvider},
    registry::Registry,
    schedule::{NextCheck, Outcome, is_due, next_check},
    store::{InMemoryStore, PolicyMutation, ResourceStore, SecretMutation, StoreError},
    time::{ManualClock, SystemClock, TimeSource},
};
