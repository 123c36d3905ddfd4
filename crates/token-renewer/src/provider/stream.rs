use super::{Renewal, TokenProvider};
use crate::context::CallContext;
use crate::mux::Session;
use core::time::Duration;
use prost::Message;
use std::sync::Arc;
use std::time::SystemTime;
use token_renewer_tonic_core::{
    Result, from_timestamp,
    proto::{
        GetTokenValidityRequest, GetTokenValidityResponse, Method, RenewTokenRequest,
        RenewTokenResponse,
    },
};

/// A provider reached through its multiplexed plugin stream.
#[derive(Clone, Debug)]
pub struct StreamProvider {
    session: Arc<Session>,
    call_timeout: Duration,
}

impl StreamProvider {
    pub const fn new(session: Arc<Session>, call_timeout: Duration) -> Self {
        Self {
            session,
            call_timeout,
        }
    }

    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[tonic::async_trait]
impl TokenProvider for StreamProvider {
    async fn renew_token(&self, ctx: &CallContext, metadata: &str, token: &str) -> Result<Renewal> {
        let ctx = ctx.child(self.call_timeout);
        let payload = RenewTokenRequest {
            metadata: metadata.to_string(),
            token: token.to_string(),
        }
        .encode_to_vec();

        let reply = self
            .session
            .call(Method::RenewToken, payload.into(), &ctx)
            .await?;
        let response = RenewTokenResponse::decode(reply)?;
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
        let payload = GetTokenValidityRequest {
            metadata: metadata.to_string(),
            token: token.to_string(),
        }
        .encode_to_vec();

        let reply = self
            .session
            .call(Method::GetTokenValidity, payload.into(), &ctx)
            .await?;
        let response = GetTokenValidityResponse::decode(reply)?;
        from_timestamp(response.expiration)
    }
}
