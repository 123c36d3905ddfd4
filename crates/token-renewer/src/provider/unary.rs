use super::{Renewal, TokenProvider};
use crate::context::CallContext;
use core::time::Duration;
use std::time::SystemTime;
use token_renewer_tonic_core::{
    Result, from_timestamp,
    proto::{
        GetTokenValidityRequest, RenewTokenRequest,
        token_provider_service_client::TokenProviderServiceClient,
    },
};
use tonic::Request;
use tonic::transport::Channel;

/// A provider reached with one gRPC call per operation.
///
/// The remaining budget of the caller's context is sent as the gRPC timeout
/// header so the plugin can give up at the same time the controller does.
#[derive(Clone, Debug)]
pub struct UnaryProvider {
    client: TokenProviderServiceClient<Channel>,
    call_timeout: Duration,
}

impl UnaryProvider {
    pub fn new(channel: Channel, call_timeout: Duration) -> Self {
        Self {
            client: TokenProviderServiceClient::new(channel),
            call_timeout,
        }
    }
}

#[tonic::async_trait]
impl TokenProvider for UnaryProvider {
    async fn renew_token(&self, ctx: &CallContext, metadata: &str, token: &str) -> Result<Renewal> {
        let ctx = ctx.child(self.call_timeout);
        let mut request = Request::new(RenewTokenRequest {
            metadata: metadata.to_string(),
            token: token.to_string(),
        });
        request.set_timeout(ctx.remaining());

        let mut client = self.client.clone();
        let response = ctx.run(client.renew_token(request)).await??.into_inner();
        Ok(Renewal {
            token: response.token,
            metadata: response.new_metadata,
            expiration: from_timestamp(response.expiration)?,
        })
    }

    async fn get_token_validity(
        &self,
        ctx: &CallContext,
        metadata: &str,
        token: &str,
    ) -> Result<SystemTime> {
        let ctx = ctx.child(self.call_timeout);
        let mut request = Request::new(GetTokenValidityRequest {
            metadata: metadata.to_string(),
            token: token.to_string(),
        });
        request.set_timeout(ctx.remaining());

        let mut client = self.client.clone();
        let response = ctx
            .run(client.get_token_validity(request))
            .await??
            .into_inner();
        from_timestamp(response.expiration)
    }
}
