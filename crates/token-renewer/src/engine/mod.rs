//! The renewal decision engine.
//!
//! [`RenewalEngine::evaluate`] takes one policy through a fixed sequence of
//! steps and either schedules the next check or fails. Nothing is retried
//! inside an evaluation; the caller decides when to try again.
//!
//! ```text
//! ResolvePolicy -> ResolveStore -> ResolveCredential -> ResolveProvider
//!   -> [expiration unknown] CheckValidity -> PersistPolicy -> Schedule
//!   -> EvaluateDue -> [not due] Schedule
//!                  -> [due] Renew -> PersistStore -> PersistPolicy -> Schedule
//! ```
//!
//! The store entry is always written before the policy: if the second write
//! fails, the next evaluation still finds the fresh credential in the store.

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::events::{EventSink, Reason, Severity};
use crate::model::{CredentialPolicy, Kind, ObjectKey, SecretEntry};
use crate::provider::{ProviderHandle, TokenProvider};
use crate::registry::Registry;
use crate::schedule::{Outcome, is_due, next_check};
use crate::store::{ResourceStore, StoreError};
use crate::time::{SystemClock, TimeSource};
use core::future::Future;
use std::time::SystemTime;
use token_renewer_tonic_core::{Error as RpcError, TOKEN_KEY};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    ResolvePolicy,
    ResolveStore,
    ResolveCredential,
    ResolveProvider,
    CheckValidity,
    EvaluateDue,
    Renew,
    PersistStore,
    PersistPolicy,
}

impl Step {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ResolvePolicy => "resolve_policy",
            Self::ResolveStore => "resolve_store",
            Self::ResolveCredential => "resolve_credential",
            Self::ResolveProvider => "resolve_provider",
            Self::CheckValidity => "check_validity",
            Self::EvaluateDue => "evaluate_due",
            Self::Renew => "renew",
            Self::PersistStore => "persist_store",
            Self::PersistPolicy => "persist_policy",
        }
    }
}

enum Persisted {
    Changed,
    Unchanged,
    Gone,
}

pub struct RenewalEngine<S, E, C = SystemClock> {
    store: S,
    events: E,
    registry: Registry,
    clock: C,
    token_key: String,
}

impl<S, E> RenewalEngine<S, E, SystemClock>
where
    S: ResourceStore,
    E: EventSink,
{
    pub fn new(store: S, events: E, registry: Registry) -> Self {
        Self {
            store,
            events,
            registry,
            clock: SystemClock,
            token_key: TOKEN_KEY.to_string(),
        }
    }
}

impl<S, E, C> RenewalEngine<S, E, C>
where
    S: ResourceStore,
    E: EventSink,
    C: TimeSource,
{
    /// Replaces the wall clock used for due checks and scheduling.
    pub fn with_clock<C2: TimeSource>(self, clock: C2) -> RenewalEngine<S, E, C2> {
        RenewalEngine {
            store: self.store,
            events: self.events,
            registry: self.registry,
            clock,
            token_key: self.token_key,
        }
    }

    /// Key of the store entry field holding the credential. Defaults to
    /// [`TOKEN_KEY`].
    #[must_use]
    pub fn with_token_key(mut self, key: impl Into<String>) -> Self {
        self.token_key = key.into();
        self
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Evaluates the policy stored under `key`.
    ///
    /// Every provider and store call is bounded by `ctx`. Failures are both
    /// returned and reported to the event sink with their [`Error::reason`].
    ///
    /// # Errors
    ///
    /// Any [`Error`]; a failed evaluation never schedules a next check.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(policy = %key))]
    pub async fn evaluate(&self, key: &ObjectKey, ctx: &CallContext) -> Result<Outcome> {
        match self.run(key, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.events
                    .emit(key, Severity::Warning, e.reason(), &e.to_string());
                Err(e)
            }
        }
    }

    async fn run(&self, key: &ObjectKey, ctx: &CallContext) -> Result<Outcome> {
        trace_step(Step::ResolvePolicy);
        let policy = match bounded(ctx, self.store.get_policy(key)).await {
            Ok(policy) => policy,
            Err(e) if e.is_not_found() => {
                tracing::debug!("Policy is gone");
                return Ok(Outcome::Gone {
                    kind: Kind::Policy,
                    key: key.clone(),
                });
            }
            Err(source) => {
                return Err(Error::Store {
                    kind: Kind::Policy,
                    key: key.clone(),
                    source,
                });
            }
        };
        validate(&policy)?;

        trace_step(Step::ResolveStore);
        let secret_key = policy.secret_key();
        let secret = match bounded(ctx, self.store.get_secret(&secret_key)).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                self.events.emit(
                    key,
                    Severity::Warning,
                    Reason::SecretNotFound,
                    &format!("Secret {secret_key} not found"),
                );
                return Ok(Outcome::Gone {
                    kind: Kind::Secret,
                    key: secret_key,
                });
            }
            Err(source) => {
                return Err(Error::Store {
                    kind: Kind::Secret,
                    key: secret_key,
                    source,
                });
            }
        };

        trace_step(Step::ResolveCredential);
        let token = self.credential(&secret)?;

        trace_step(Step::ResolveProvider);
        let provider_name = policy.spec.provider_name.as_str();
        let provider = self.registry.get(provider_name)?;
        let before = policy.spec.before_duration;

        let Some(expiration) = policy.status.expiration_time else {
            trace_step(Step::CheckValidity);
            let expiration = provider
                .get_token_validity(ctx, &policy.spec.metadata, &token)
                .await
                .map_err(|source| Error::ValidityCheckFailed {
                    provider: provider_name.to_string(),
                    source,
                })?;

            if let Persisted::Gone = self.persist_policy(&policy, None, expiration, ctx).await? {
                return Ok(gone_policy(key));
            }
            return Ok(self.schedule(expiration, &policy, false));
        };

        trace_step(Step::EvaluateDue);
        if !is_due(expiration, before, self.clock.now()) {
            tracing::debug!("Credential is not due for renewal");
            return Ok(self.schedule(expiration, &policy, false));
        }

        trace_step(Step::Renew);
        let renewal = renew(&provider, provider_name, &policy, &token, ctx).await?;
        tracing::info!(provider = provider_name, "Credential renewed");

        trace_step(Step::PersistStore);
        if renewal.token == token {
            tracing::debug!("Renewed credential is unchanged");
        } else {
            self.persist_secret(key, &secret_key, &renewal.token, ctx)
                .await?;
        }

        trace_step(Step::PersistPolicy);
        let metadata = (!renewal.metadata.is_empty()).then_some(renewal.metadata);
        if let Persisted::Gone = self
            .persist_policy(&policy, metadata, renewal.expiration, ctx)
            .await?
        {
            return Ok(gone_policy(key));
        }

        let outcome = self.schedule(renewal.expiration, &policy, true);
        self.events.emit(
            key,
            Severity::Normal,
            Reason::TokenRenewed,
            &format!("Token renewed with provider {provider_name}"),
        );
        Ok(outcome)
    }

    fn credential(&self, secret: &SecretEntry) -> Result<String> {
        let raw = secret
            .data
            .get(&self.token_key)
            .ok_or_else(|| Error::StoreKeyMissing {
                secret: secret.key.clone(),
                key: self.token_key.clone(),
            })?;
        if raw.is_empty() {
            return Err(Error::StoreValueEmpty {
                secret: secret.key.clone(),
                key: self.token_key.clone(),
            });
        }
        String::from_utf8(raw.clone()).map_err(|_| Error::StoreValueNotUtf8 {
            secret: secret.key.clone(),
            key: self.token_key.clone(),
        })
    }

    async fn persist_secret(
        &self,
        policy_key: &ObjectKey,
        secret_key: &ObjectKey,
        token: &str,
        ctx: &CallContext,
    ) -> Result<()> {
        let field = self.token_key.clone();
        let value = token.as_bytes().to_vec();
        let write = move |s: &mut SecretEntry| {
            s.data.insert(field.clone(), value.clone());
        };

        match bounded(ctx, self.store.update_secret(secret_key, &write)).await {
            Ok(true) => {
                self.events.emit(
                    policy_key,
                    Severity::Normal,
                    Reason::SecretUpdated,
                    &format!("Secret {secret_key} updated"),
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(source) => Err(Error::PersistFailed {
                kind: Kind::Secret,
                key: secret_key.clone(),
                source,
            }),
        }
    }

    async fn persist_policy(
        &self,
        policy: &CredentialPolicy,
        metadata: Option<String>,
        expiration: SystemTime,
        ctx: &CallContext,
    ) -> Result<Persisted> {
        let metadata = metadata.filter(|m| *m != policy.spec.metadata);
        if metadata.is_none() && policy.status.expiration_time == Some(expiration) {
            return Ok(Persisted::Unchanged);
        }

        let write = move |p: &mut CredentialPolicy| {
            if let Some(m) = &metadata {
                p.spec.metadata.clone_from(m);
            }
            p.status.expiration_time = Some(expiration);
        };

        match bounded(ctx, self.store.update_policy(&policy.key, &write)).await {
            Ok(true) => {
                self.events.emit(
                    &policy.key,
                    Severity::Normal,
                    Reason::TokenUpdated,
                    "Policy expiration and metadata updated",
                );
                Ok(Persisted::Changed)
            }
            Ok(false) => Ok(Persisted::Unchanged),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Policy deleted during evaluation");
                Ok(Persisted::Gone)
            }
            Err(source) => Err(Error::PersistFailed {
                kind: Kind::Policy,
                key: policy.key.clone(),
                source,
            }),
        }
    }

    fn schedule(&self, expiration: SystemTime, policy: &CredentialPolicy, renewed: bool) -> Outcome {
        let next = next_check(expiration, policy.spec.before_duration, self.clock.now());
        tracing::debug!(requeue_after = ?next.requeue_after, renewed, "Scheduled next check");
        Outcome::Scheduled {
            next,
            renewed,
            expiration,
        }
    }
}

fn validate(policy: &CredentialPolicy) -> Result<()> {
    if policy.spec.provider_name.trim().is_empty() {
        return Err(Error::InvalidPolicy {
            key: policy.key.clone(),
            reason: "providerName is empty".to_string(),
        });
    }
    if policy.spec.secret_ref.trim().is_empty() {
        return Err(Error::InvalidPolicy {
            key: policy.key.clone(),
            reason: "secretRef is empty".to_string(),
        });
    }
    if policy.spec.metadata.is_empty() {
        return Err(Error::MetadataEmpty {
            key: policy.key.clone(),
        });
    }
    Ok(())
}

async fn renew(
    provider: &ProviderHandle,
    provider_name: &str,
    policy: &CredentialPolicy,
    token: &str,
    ctx: &CallContext,
) -> Result<crate::provider::Renewal> {
    let renewal = provider
        .renew_token(ctx, &policy.spec.metadata, token)
        .await
        .map_err(|source| Error::RenewalFailed {
            provider: provider_name.to_string(),
            source,
        })?;

    if renewal.token.is_empty() {
        return Err(Error::RenewalFailed {
            provider: provider_name.to_string(),
            source: RpcError::Remote {
                message: "provider returned an empty token".to_string(),
            },
        });
    }
    Ok(renewal)
}

/// Runs a store call under `ctx`.
async fn bounded<T, F>(ctx: &CallContext, fut: F) -> core::result::Result<T, StoreError>
where
    F: Future<Output = core::result::Result<T, StoreError>>,
{
    ctx.run(fut).await?
}

fn gone_policy(key: &ObjectKey) -> Outcome {
    Outcome::Gone {
        kind: Kind::Policy,
        key: key.clone(),
    }
}

fn trace_step(step: Step) {
    tracing::trace!(step = step.as_str(), "Evaluation step");
}
