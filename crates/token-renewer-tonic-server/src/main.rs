//! # token-renewer controller
//!
//! Seeds an in-memory store from a state file, accepts provider plugins on a
//! Unix socket or TCP address, and keeps every policy's credential renewed.

mod server;

use clap::Parser;
use core::time::Duration;
use futures::Stream;
use server::config::{CliArgs, ListenAddr, ServerConfig};
use server::runner::{RunnerConfig, spawn_all};
use server::telemetry::{self, TelemetryProviders, init_telemetry};
use std::sync::Arc;
use token_renewer::{
    InMemoryStore, PluginStreamHandler, Registry, RenewalEngine, SessionConfig, TracingEventSink,
};
use token_renewer_tonic_core::proto::{
    FILE_DESCRIPTOR_SET, plugin_stream_service_server::PluginStreamServiceServer,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Connected;
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const METRICS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let store = Arc::new(InMemoryStore::new());
    let (policies, secrets) = server::state::seed(&store, server::state::load(&config.state_file)?);
    tracing::info!(policies, secrets, "Loaded state file");

    let registry = Registry::new();
    if let Some(dir) = &config.plugins_dir {
        discover(&registry, dir, &config)?;
    }

    match config.listen.clone() {
        ListenAddr::Unix(path) => {
            #[cfg(unix)]
            {
                use tokio::net::UnixListener;
                use tokio_stream::wrappers::UnixListenerStream;
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let uds = UnixListener::bind(&path)?;
                let incoming = UnixListenerStream::new(uds);
                log_startup_info(&config);
                let res = run(providers, incoming, config, store, registry).await;
                // Best effort: a panic can still leave the socket behind.
                let _ = std::fs::remove_file(&path);
                res
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                anyhow::bail!("Unix domain sockets are not supported on this platform");
            }
        }
        ListenAddr::Tcp(addr) => {
            let tcp = TcpListener::bind(&addr).await?;
            let incoming = TcpListenerStream::new(tcp);
            log_startup_info(&config);
            run(providers, incoming, config, store, registry).await
        }
    }
}

#[cfg(unix)]
fn discover(registry: &Registry, dir: &std::path::Path, config: &ServerConfig) -> anyhow::Result<()> {
    let names = token_renewer::discovery::register_discovered(registry, dir, config.call_timeout)?;
    tracing::info!(dir = %dir.display(), ?names, "Registered socket providers");
    Ok(())
}

#[cfg(not(unix))]
fn discover(_: &Registry, _: &std::path::Path, _: &ServerConfig) -> anyhow::Result<()> {
    anyhow::bail!("Socket discovery is not supported on this platform")
}

async fn run<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
    store: Arc<InMemoryStore>,
    registry: Registry,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let shutdown = CancellationToken::new();

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<PluginStreamServiceServer<PluginStreamHandler>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let handler = PluginStreamHandler::new(
        registry.clone(),
        SessionConfig {
            handshake_timeout: config.handshake_timeout,
            call_timeout: config.call_timeout,
            outbound_buffer: config.outbound_buffer,
        },
    );

    let engine = Arc::new(RenewalEngine::new(store, TracingEventSink, registry.clone()));
    let runner = RunnerConfig {
        evaluation_timeout: config.evaluation_timeout,
        resync: config.resync,
        backoff: config.backoff,
    };
    let mut evaluations = spawn_all(engine, runner, shutdown.clone()).await?;
    tokio::spawn(report_registry(registry.clone(), shutdown.clone()));

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(PluginStreamServiceServer::new(handler))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(health_reporter, shutdown, registry),
        )
        .await?;

    while let Some(res) = evaluations.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "Evaluation task failed");
        }
    }

    tracing::info!("Controller shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Accepting plugins on {} with full config: {:#?}",
            config.listen,
            config
        );
    } else {
        tracing::info!("Accepting plugins on {}", config.listen);
    }
}

async fn report_registry(registry: Registry, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(METRICS_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = tick.tick() => {
                telemetry::record_registry(registry.len(), registry.outstanding_calls());
            }
        }
    }
}

async fn shutdown_signal(
    health_reporter: HealthReporter,
    shutdown: CancellationToken,
    registry: Registry,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<PluginStreamServiceServer<PluginStreamHandler>>()
        .await;

    // 2. Stop evaluations, then release every plugin
    shutdown.cancel();
    let dropped = registry.drop_all();
    tracing::info!(dropped, "Released providers");
}
