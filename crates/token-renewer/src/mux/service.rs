use super::session::Session;
use crate::provider::{ProviderHandle, StreamProvider};
use crate::registry::Registry;
use core::pin::Pin;
use core::time::Duration;
use futures::{Stream, StreamExt};
use token_renewer_tonic_core::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    proto::{PluginStreamMessage, plugin_stream_service_server::PluginStreamService},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

type OutboundStream =
    Pin<Box<dyn Stream<Item = Result<PluginStreamMessage, Status>> + Send + 'static>>;

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    /// Capacity of each session's outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            outbound_buffer: 64,
        }
    }
}

/// gRPC entry point for plugins that dial in and speak the multiplexed
/// stream protocol.
///
/// Each accepted stream is handshaken, registered under its announced name
/// and then read by a dedicated task until it ends.
#[derive(Clone, Debug)]
pub struct PluginStreamHandler {
    registry: Registry,
    config: SessionConfig,
}

impl PluginStreamHandler {
    pub const fn new(registry: Registry, config: SessionConfig) -> Self {
        Self { registry, config }
    }
}

#[tonic::async_trait]
impl PluginStreamService for PluginStreamHandler {
    type PluginStreamStream = OutboundStream;

    async fn plugin_stream(
        &self,
        request: Request<Streaming<PluginStreamMessage>>,
    ) -> Result<Response<Self::PluginStreamStream>, Status> {
        let remote = request.remote_addr();
        let mut inbound = request.into_inner();

        let registration = Session::handshake(&mut inbound, self.config.handshake_timeout)
            .await
            .inspect_err(|e| tracing::warn!(?remote, error = %e, "Rejecting plugin stream"))?;

        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let session = Session::new(registration, tx);
        tracing::info!(
            provider = session.name(),
            version = session.version(),
            ?remote,
            "Plugin connected"
        );

        let handle =
            ProviderHandle::Stream(StreamProvider::new(session.clone(), self.config.call_timeout));
        self.registry
            .register(session.name(), handle)
            .map_err(|e| Status::unavailable(e.to_string()))?;

        let outbound = ReceiverStream::new(rx).take_until(session.closed_owned());
        tokio::spawn(session.run(inbound, self.registry.clone()));

        Ok(Response::new(Box::pin(outbound)))
    }
}
