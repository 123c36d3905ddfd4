#![cfg(unix)]

use core::time::Duration;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use token_renewer::{
    CallContext, ProviderHandle, Registry, Renewal, TokenProvider, UnaryProvider,
    discovery::{register_discovered, unix_channel},
    plugin::serve_unary,
};
use token_renewer_tonic_core::{Error as RpcError, Result as RpcResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Appends `!` to the token and records the budget it was given.
#[derive(Default)]
struct Bang {
    budgets: Mutex<Vec<Duration>>,
}

#[tonic::async_trait]
impl TokenProvider for Bang {
    async fn renew_token(&self, ctx: &CallContext, metadata: &str, token: &str) -> RpcResult<Renewal> {
        self.budgets.lock().push(ctx.remaining());
        if token == "revoked" {
            return Err(RpcError::Remote {
                message: "token revoked".into(),
            });
        }
        Ok(Renewal {
            token: format!("{token}!"),
            metadata: format!("{metadata}+1"),
            expiration: SystemTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000),
        })
    }

    async fn get_token_validity(
        &self,
        _: &CallContext,
        _: &str,
        _: &str,
    ) -> RpcResult<SystemTime> {
        std::future::pending().await
    }
}

async fn start_plugin(dir: &Path, name: &str, provider: Arc<Bang>) -> (PathBuf, CancellationToken) {
    let path = dir.join(format!("{name}.sock"));
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_unary(path.clone(), provider, shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket never appeared");
    (path, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renew_round_trips_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let bang = Arc::new(Bang::default());
    let (path, shutdown) = start_plugin(dir.path(), "bang", bang.clone()).await;

    let provider = UnaryProvider::new(unix_channel(&path), Duration::from_secs(30));
    let ctx = CallContext::with_timeout(Duration::from_secs(1));

    let renewal = provider.renew_token(&ctx, "m", "t").await.unwrap();
    assert_eq!(renewal.token, "t!");
    assert_eq!(renewal.metadata, "m+1");
    assert_eq!(
        renewal.expiration,
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000)
    );

    // The caller's remaining budget travels as the grpc-timeout header.
    let budget = bang.budgets.lock()[0];
    assert!(budget <= Duration::from_secs(1), "budget was {budget:?}");
    assert!(budget > Duration::from_millis(500), "budget was {budget:?}");

    let err = provider.renew_token(&ctx, "m", "revoked").await.unwrap_err();
    assert!(matches!(err, RpcError::Transport { .. }), "{err:?}");

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_plugin_hits_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let (path, shutdown) = start_plugin(dir.path(), "bang", Arc::new(Bang::default())).await;

    let provider = UnaryProvider::new(unix_channel(&path), Duration::from_secs(30));
    let ctx = CallContext::with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let err = provider
        .get_token_validity(&ctx, "m", "t")
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(3));

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovered_socket_serves_renewals() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, shutdown) = start_plugin(dir.path(), "bang", Arc::new(Bang::default())).await;

    let registry = Registry::new();
    let names = register_discovered(&registry, dir.path(), Duration::from_secs(5)).unwrap();
    assert_eq!(names, ["bang"]);

    let handle = registry.get("bang").unwrap();
    assert!(matches!(handle, ProviderHandle::Unary(_)));
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    assert_eq!(handle.renew_token(&ctx, "m", "x").await.unwrap().token, "x!");

    shutdown.cancel();
}
