//! The provider capability and the transports that can carry it.
//!
//! Whatever the transport, a provider is used through [`TokenProvider`]. The
//! transport is picked once, when the provider is registered, by choosing the
//! [`ProviderHandle`] variant.

mod stream;
mod unary;

pub use stream::StreamProvider;
pub use unary::UnaryProvider;

use crate::context::CallContext;
use core::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use token_renewer_tonic_core::{Error as RpcError, Result as RpcResult};

/// A credential issued by [`TokenProvider::renew_token`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Renewal {
    pub token: String,
    /// Replacement provider metadata. Empty means "keep the current value".
    pub metadata: String,
    pub expiration: SystemTime,
}

/// Renews and inspects credentials on behalf of the engine.
///
/// Implementations must honor `ctx`: return promptly with
/// [`RpcError::DeadlineExceeded`] or [`RpcError::Cancelled`] once it fires.
#[tonic::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Issues a replacement for `token`.
    async fn renew_token(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<Renewal>;

    /// Reports when `token` expires.
    async fn get_token_validity(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<SystemTime>;
}

#[tonic::async_trait]
impl<T> TokenProvider for Arc<T>
where
    T: TokenProvider + ?Sized,
{
    async fn renew_token(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<Renewal> {
        (**self).renew_token(ctx, metadata, token).await
    }

    async fn get_token_validity(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<SystemTime> {
        (**self).get_token_validity(ctx, metadata, token).await
    }
}

/// A registered provider together with its transport.
#[derive(Clone)]
pub enum ProviderHandle {
    /// One gRPC call per operation, usually over a discovered Unix socket.
    Unary(UnaryProvider),
    /// Calls multiplexed over a plugin-initiated stream.
    Stream(StreamProvider),
    /// An implementation living in this process.
    Local(Arc<dyn TokenProvider>),
}

impl ProviderHandle {
    pub fn local<P>(provider: P) -> Self
    where
        P: TokenProvider + 'static,
    {
        Self::Local(Arc::new(provider))
    }

    pub const fn transport(&self) -> &'static str {
        match self {
            Self::Unary(_) => "unary",
            Self::Stream(_) => "stream",
            Self::Local(_) => "local",
        }
    }

    /// A stream handle dies with its session; the others are always usable.
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Stream(p) => !p.session().is_closed(),
            Self::Unary(_) | Self::Local(_) => true,
        }
    }

    /// Releases the transport, failing any calls still in flight.
    pub(crate) fn teardown(&self, name: &str) -> usize {
        match self {
            Self::Stream(p) => p.session().close(RpcError::Disconnected {
                provider: name.to_string(),
            }),
            Self::Unary(_) | Self::Local(_) => 0,
        }
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary(p) => f.debug_tuple("Unary").field(p).finish(),
            Self::Stream(p) => f.debug_tuple("Stream").field(p).finish(),
            Self::Local(_) => f.write_str("Local(..)"),
        }
    }
}

#[tonic::async_trait]
impl TokenProvider for ProviderHandle {
    async fn renew_token(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<Renewal> {
        match self {
            Self::Unary(p) => p.renew_token(ctx, metadata, token).await,
            Self::Stream(p) => p.renew_token(ctx, metadata, token).await,
            Self::Local(p) => ctx.run(p.renew_token(ctx, metadata, token)).await?,
        }
    }

    async fn get_token_validity(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> RpcResult<SystemTime> {
        match self {
            Self::Unary(p) => p.get_token_validity(ctx, metadata, token).await,
            Self::Stream(p) => p.get_token_validity(ctx, metadata, token).await,
            Self::Local(p) => ctx.run(p.get_token_validity(ctx, metadata, token)).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    struct Stalled;

    #[tonic::async_trait]
    impl TokenProvider for Stalled {
        async fn renew_token(&self, _: &CallContext, _: &str, _: &str) -> RpcResult<Renewal> {
            std::future::pending().await
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

    #[tokio::test(start_paused = true)]
    async fn local_handle_enforces_deadline() {
        let handle = ProviderHandle::local(Stalled);
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        assert_eq!(
            handle.renew_token(&ctx, "m", "t").await,
            Err(RpcError::DeadlineExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn local_handle_honors_cancel() {
        let handle = ProviderHandle::local(Stalled);
        let ctx = CallContext::with_timeout(Duration::from_secs(60));
        ctx.cancel();
        assert_eq!(
            handle.get_token_validity(&ctx, "m", "t").await,
            Err(RpcError::Cancelled)
        );
    }

    #[test]
    fn local_handle_is_always_alive() {
        let handle = ProviderHandle::local(Stalled);
        assert!(handle.is_alive());
        assert_eq!(handle.transport(), "local");
        assert_eq!(handle.teardown("x"), 0);
    }
}
