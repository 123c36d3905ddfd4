//! Plugin side of both provider transports.
//!
//! A plugin implements [`TokenProvider`](crate::TokenProvider) once and
//! exposes it either by serving `TokenProviderService` on a Unix socket for
//! discovery ([`serve_unary`]) or by dialing the controller and answering
//! requests over a multiplexed stream ([`run_stream_client`]).

mod stream;
#[cfg(unix)]
mod unary;

pub use stream::run_stream_client;
#[cfg(unix)]
pub use unary::{UnaryService, serve_unary};

use token_renewer_tonic_core::Error as RpcError;

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Controller returned an error: {0}")]
    Status(#[from] tonic::Status),

    #[error("Stream error: {0}")]
    Stream(#[from] RpcError),
}
