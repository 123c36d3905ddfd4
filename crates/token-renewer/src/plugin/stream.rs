use super::PluginError;
use crate::context::CallContext;
use crate::provider::TokenProvider;
use bytes::Bytes;
use prost::Message;
use std::sync::Arc;
use token_renewer_tonic_core::{
    DEFAULT_CALL_TIMEOUT, Error as RpcError,
    proto::{
        GetTokenValidityRequest, GetTokenValidityResponse, Method, PluginStreamMessage,
        Registration, RenewTokenRequest, RenewTokenResponse, RpcRequest, RpcResponse,
        plugin_stream_message::Frame, plugin_stream_service_client::PluginStreamServiceClient,
    },
    to_timestamp,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

const OUTBOUND_BUFFER: usize = 64;

/// Dials the controller, registers as `registration.name` and answers
/// requests until the controller closes the stream or `shutdown` fires.
///
/// Requests are answered concurrently; a provider failure is sent back in
/// the response's error field rather than ending the stream. Requests still
/// running at shutdown are dropped unanswered.
///
/// # Errors
///
/// Fails if the stream cannot be opened, the controller rejects the
/// registration, or the stream breaks.
pub async fn run_stream_client<P>(
    channel: Channel,
    registration: Registration,
    provider: Arc<P>,
    shutdown: CancellationToken,
) -> Result<(), PluginError>
where
    P: TokenProvider + ?Sized + 'static,
{
    let name = registration.name.clone();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    tx.send(PluginStreamMessage {
        frame: Some(Frame::Registration(registration)),
    })
    .await
    .map_err(|_| RpcError::ChannelError {
        context: "registration frame".to_string(),
    })?;

    let mut client = PluginStreamServiceClient::new(channel);
    let mut inbound = client
        .plugin_stream(ReceiverStream::new(rx))
        .await?
        .into_inner();
    tracing::info!(provider = %name, "Registered with controller");

    let mut in_flight = JoinSet::new();
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            next = inbound.message() => next?,
        };
        let Some(msg) = next else {
            tracing::info!(provider = %name, "Controller closed the stream");
            break;
        };

        match msg.frame {
            Some(Frame::Request(request)) => {
                let provider = provider.clone();
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let response = answer(&*provider, request).await;
                    // The stream may already be gone.
                    let _ = tx.send(response).await;
                });
            }
            _ => tracing::warn!(provider = %name, "Ignoring unexpected frame"),
        }
    }

    // Requests still running are abandoned; the controller fails them when
    // the stream ends.
    in_flight.shutdown().await;
    Ok(())
}

async fn answer<P>(provider: &P, request: RpcRequest) -> PluginStreamMessage
where
    P: TokenProvider + ?Sized,
{
    let ctx = CallContext::with_timeout(DEFAULT_CALL_TIMEOUT);
    let method = Method::try_from(request.method).unwrap_or(Method::Unspecified);

    let result = match method {
        Method::RenewToken => renew(provider, &ctx, request.payload).await,
        Method::GetTokenValidity => validity(provider, &ctx, request.payload).await,
        Method::Unspecified => Err(RpcError::InvalidFrame {
            reason: format!("unknown method {}", request.method),
        }),
    };

    let (payload, error) = match result {
        Ok(payload) => (payload, String::new()),
        Err(RpcError::Remote { message }) => (Bytes::new(), message),
        Err(e) => (Bytes::new(), e.to_string()),
    };
    if !error.is_empty() {
        tracing::warn!(
            correlation_id = request.correlation_id,
            method = method.rpc_name(),
            %error,
            "Provider call failed"
        );
    }

    PluginStreamMessage {
        frame: Some(Frame::Response(RpcResponse {
            correlation_id: request.correlation_id,
            payload,
            error,
        })),
    }
}

async fn renew<P>(provider: &P, ctx: &CallContext, payload: Bytes) -> Result<Bytes, RpcError>
where
    P: TokenProvider + ?Sized,
{
    let req = RenewTokenRequest::decode(payload)?;
    let renewal = ctx
        .run(provider.renew_token(ctx, &req.metadata, &req.token))
        .await??;
    let reply = RenewTokenResponse {
        token: renewal.token,
        new_metadata: renewal.metadata,
        expiration: Some(to_timestamp(renewal.expiration)),
    };
    Ok(reply.encode_to_vec().into())
}

async fn validity<P>(provider: &P, ctx: &CallContext, payload: Bytes) -> Result<Bytes, RpcError>
where
    P: TokenProvider + ?Sized,
{
    let req = GetTokenValidityRequest::decode(payload)?;
    let expiration = ctx
        .run(provider.get_token_validity(ctx, &req.metadata, &req.token))
        .await??;
    let reply = GetTokenValidityResponse {
        expiration: Some(to_timestamp(expiration)),
    };
    Ok(reply.encode_to_vec().into())
}
