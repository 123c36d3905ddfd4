use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use token_renewer::{
    CallContext, PluginStreamHandler, Registry, Renewal, SessionConfig, TokenProvider,
    plugin::run_stream_client,
};
use token_renewer_tonic_core::{
    Error as RpcError, Result as RpcResult,
    proto::{Registration, plugin_stream_service_server::PluginStreamServiceServer},
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};

/// Echoes the request back so callers can check they got their own answer.
struct Echo {
    calls: AtomicUsize,
    hang_on: Option<&'static str>,
}

#[tonic::async_trait]
impl TokenProvider for Echo {
    async fn renew_token(&self, _: &CallContext, metadata: &str, token: &str) -> RpcResult<Renewal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_on == Some(token) {
            return std::future::pending().await;
        }
        if token == "revoked" {
            return Err(RpcError::Remote {
                message: "token revoked".into(),
            });
        }
        // Stagger completions so responses come back out of order.
        let delay = token.len() as u64 % 5;
        tokio::time::sleep(Duration::from_millis(delay * 10)).await;
        Ok(Renewal {
            token: format!("{token}-renewed"),
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
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

async fn start_controller(registry: Registry, shutdown: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = PluginStreamHandler::new(
        registry,
        SessionConfig {
            call_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        },
    );
    tokio::spawn(
        Server::builder()
            .add_service(PluginStreamServiceServer::new(handler))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            ),
    );
    addr
}

fn start_plugin(
    addr: SocketAddr,
    name: &str,
    provider: Arc<Echo>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let registration = Registration {
        name: name.into(),
        version: "0.1.0".into(),
    };
    tokio::spawn(async move {
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        run_stream_client(channel, registration, provider, shutdown)
            .await
            .unwrap();
    })
}

async fn wait_registered(registry: &Registry, name: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.get(name).is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("plugin never registered");
}

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_round_trip_through_the_stream() {
    let registry = Registry::new();
    let server_shutdown = CancellationToken::new();
    let plugin_shutdown = CancellationToken::new();
    let addr = start_controller(registry.clone(), server_shutdown.clone()).await;
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
        hang_on: None,
    });
    let plugin = start_plugin(addr, "echo", echo.clone(), plugin_shutdown.clone());
    wait_registered(&registry, "echo").await;

    let handle = registry.get("echo").unwrap();
    assert_eq!(handle.transport(), "stream");

    let expiration = handle.get_token_validity(&ctx(), "m", "t").await.unwrap();
    assert_eq!(
        expiration,
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );

    let renewal = handle.renew_token(&ctx(), "acct", "abc").await.unwrap();
    assert_eq!(renewal.token, "abc-renewed");
    assert_eq!(renewal.metadata, "acct+1");

    let err = handle.renew_token(&ctx(), "acct", "revoked").await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Remote {
            message: "token revoked".into()
        }
    );

    plugin_shutdown.cancel();
    plugin.await.unwrap();
    server_shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_are_correlated() {
    let registry = Registry::new();
    let shutdown = CancellationToken::new();
    let addr = start_controller(registry.clone(), shutdown.clone()).await;
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
        hang_on: None,
    });
    let _plugin = start_plugin(addr, "echo", echo.clone(), shutdown.child_token());
    wait_registered(&registry, "echo").await;

    let handle = registry.get("echo").unwrap();
    let calls: Vec<_> = (0..32)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let token = format!("t{i}");
                let renewal = handle.renew_token(&ctx(), "m", &token).await.unwrap();
                (token, renewal.token)
            })
        })
        .collect();

    for call in calls {
        let (sent, got) = call.await.unwrap();
        assert_eq!(got, format!("{sent}-renewed"));
    }
    assert_eq!(echo.calls.load(Ordering::SeqCst), 32);
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plugin_disconnect_fails_pending_call() {
    let registry = Registry::new();
    let shutdown = CancellationToken::new();
    let plugin_shutdown = CancellationToken::new();
    let addr = start_controller(registry.clone(), shutdown.clone()).await;
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
        hang_on: Some("stuck"),
    });
    let plugin = start_plugin(addr, "echo", echo.clone(), plugin_shutdown.clone());
    wait_registered(&registry, "echo").await;

    let handle = registry.get("echo").unwrap();
    let pending = tokio::spawn(async move { handle.renew_token(&ctx(), "m", "stuck").await });

    while echo.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    plugin_shutdown.cancel();
    plugin.await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending call hung")
        .unwrap()
        .unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {err:?}");

    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.get("echo").is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never unregistered");
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregister_fails_pending_call_with_disconnect() {
    let registry = Registry::new();
    let shutdown = CancellationToken::new();
    let addr = start_controller(registry.clone(), shutdown.clone()).await;
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
        hang_on: Some("stuck"),
    });
    let _plugin = start_plugin(addr, "echo", echo.clone(), shutdown.child_token());
    wait_registered(&registry, "echo").await;

    let handle = registry.get("echo").unwrap();
    let pending = tokio::spawn(async move { handle.renew_token(&ctx(), "m", "stuck").await });
    while echo.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(registry.unregister("echo"));
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RpcError::Disconnected {
            provider: "echo".into()
        }
    );
    shutdown.cancel();
}
