//! Drives evaluations: one task per policy, each sleeping until its next
//! check and backing off after failures.

use super::config::Backoff;
use super::telemetry;
use core::time::Duration;
use std::sync::Arc;
use token_renewer::{
    CallContext, EventSink, Kind, ObjectKey, Outcome, RenewalEngine, ResourceStore, TimeSource,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub evaluation_timeout: Duration,
    /// Longest sleep between two evaluations of one policy.
    pub resync: Duration,
    pub backoff: Backoff,
}

/// Evaluates `key` until the policy goes away or `shutdown` fires.
///
/// A missing store entry is retried with the failure backoff.
pub async fn run_policy<S, E, C>(
    engine: Arc<RenewalEngine<S, E, C>>,
    key: ObjectKey,
    config: RunnerConfig,
    shutdown: CancellationToken,
) where
    S: ResourceStore,
    E: EventSink,
    C: TimeSource,
{
    let mut failures = 0u32;
    loop {
        let ctx = CallContext::with_deadline(
            Instant::now() + config.evaluation_timeout,
            shutdown.child_token(),
        );
        let started = Instant::now();
        telemetry::increment_evaluations();

        let delay = match engine.evaluate(&key, &ctx).await {
            Ok(Outcome::Gone {
                kind: Kind::Policy,
                ..
            }) => {
                tracing::info!(policy = %key, "Policy deleted, stopping evaluations");
                return;
            }
            // The store entry may be provisioned after its policy.
            Ok(Outcome::Gone { kind, key: gone }) => {
                failures = failures.saturating_add(1);
                let delay = config.backoff.delay(failures);
                tracing::info!(
                    policy = %key,
                    %kind,
                    object = %gone,
                    retry_in = ?delay,
                    "Referenced object missing"
                );
                delay
            }
            Ok(outcome) => {
                failures = 0;
                if outcome.renewed() {
                    telemetry::increment_renewals();
                }
                outcome
                    .requeue_after()
                    .map_or(config.resync, |after| after.min(config.resync))
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                telemetry::increment_evaluation_errors(e.reason().as_str());
                let delay = config.backoff.delay(failures);
                tracing::warn!(
                    policy = %key,
                    error = %e,
                    failures,
                    retry_in = ?delay,
                    "Evaluation failed"
                );
                delay
            }
        };
        telemetry::record_evaluation_duration(started.elapsed().as_secs_f64() * 1000.0);

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Spawns [`run_policy`] for every policy currently in the store.
///
/// # Errors
///
/// Fails if the policy list cannot be read.
pub async fn spawn_all<S, E, C>(
    engine: Arc<RenewalEngine<S, E, C>>,
    config: RunnerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<JoinSet<()>>
where
    S: ResourceStore + 'static,
    E: EventSink + 'static,
    C: TimeSource + 'static,
{
    let keys = engine.store().list_policies().await?;
    tracing::info!(policies = keys.len(), "Starting evaluations");

    let mut tasks = JoinSet::new();
    for key in keys {
        tasks.spawn(run_policy(engine.clone(), key, config, shutdown.clone()));
    }
    Ok(tasks)
}
