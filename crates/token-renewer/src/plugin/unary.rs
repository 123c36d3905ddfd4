use super::PluginError;
use crate::context::CallContext;
use crate::provider::TokenProvider;
use core::time::Duration;
use std::path::Path;
use token_renewer_tonic_core::{
    DEFAULT_CALL_TIMEOUT,
    proto::{
        GetTokenValidityRequest, GetTokenValidityResponse, RenewTokenRequest, RenewTokenResponse,
        token_provider_service_server::{TokenProviderService, TokenProviderServiceServer},
    },
    to_timestamp,
};
use tokio::net::UnixListener;
use tokio::time::Instant;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Adapts a [`TokenProvider`] to the generated `TokenProviderService`.
pub struct UnaryService<P> {
    provider: P,
    shutdown: CancellationToken,
}

impl<P> UnaryService<P> {
    pub const fn new(provider: P, shutdown: CancellationToken) -> Self {
        Self { provider, shutdown }
    }

    /// Deadline from the caller's `grpc-timeout`, capped by the default call
    /// bound.
    fn context<T>(&self, request: &Request<T>) -> CallContext {
        let timeout = request
            .metadata()
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map_or(DEFAULT_CALL_TIMEOUT, |t| t.min(DEFAULT_CALL_TIMEOUT));
        CallContext::with_deadline(Instant::now() + timeout, self.shutdown.child_token())
    }
}

#[tonic::async_trait]
impl<P> TokenProviderService for UnaryService<P>
where
    P: TokenProvider + 'static,
{
    async fn renew_token(
        &self,
        request: Request<RenewTokenRequest>,
    ) -> Result<Response<RenewTokenResponse>, Status> {
        let ctx = self.context(&request);
        let req = request.into_inner();
        let renewal = ctx
            .run(self.provider.renew_token(&ctx, &req.metadata, &req.token))
            .await??;

        Ok(Response::new(RenewTokenResponse {
            token: renewal.token,
            new_metadata: renewal.metadata,
            expiration: Some(to_timestamp(renewal.expiration)),
        }))
    }

    async fn get_token_validity(
        &self,
        request: Request<GetTokenValidityRequest>,
    ) -> Result<Response<GetTokenValidityResponse>, Status> {
        let ctx = self.context(&request);
        let req = request.into_inner();
        let expiration = ctx
            .run(self.provider.get_token_validity(&ctx, &req.metadata, &req.token))
            .await??;

        Ok(Response::new(GetTokenValidityResponse {
            expiration: Some(to_timestamp(expiration)),
        }))
    }
}

/// Parses a `grpc-timeout` header value such as `250m` or `30S`.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.saturating_mul(3600))),
        "M" => Some(Duration::from_secs(amount.saturating_mul(60))),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Serves `provider` on a Unix socket at `socket_path` until `shutdown`
/// fires.
///
/// A stale socket file left by a previous run is replaced, and the socket
/// is removed again on the way out.
///
/// # Errors
///
/// Fails if the socket cannot be bound or the server stops with an error.
pub async fn serve_unary<P>(
    socket_path: impl AsRef<Path>,
    provider: P,
    shutdown: CancellationToken,
) -> Result<(), PluginError>
where
    P: TokenProvider + 'static,
{
    let path = socket_path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "Serving provider");

    let service = TokenProviderServiceServer::new(UnaryService::new(provider, shutdown.clone()));
    let served = Server::builder()
        .timeout(DEFAULT_CALL_TIMEOUT)
        .add_service(service)
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            shutdown.cancelled_owned(),
        )
        .await;

    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(error = %e, "Socket already removed");
    }
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("30S"), Some(Duration::from_secs(30)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("10"), None);
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("1234567890S"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_is_capped() {
        let service = UnaryService::new((), CancellationToken::new());

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("grpc-timeout", "500m".parse().unwrap());
        assert_eq!(service.context(&request).remaining(), Duration::from_millis(500));

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("grpc-timeout", "5M".parse().unwrap());
        assert_eq!(service.context(&request).remaining(), DEFAULT_CALL_TIMEOUT);

        assert_eq!(
            service.context(&Request::new(())).remaining(),
            DEFAULT_CALL_TIMEOUT
        );
    }
}
