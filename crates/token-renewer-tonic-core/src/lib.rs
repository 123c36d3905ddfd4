//! # `token-renewer-tonic-core`
//!
//! Wire protocol shared by the token-renewer controller and its provider
//! plugins.
//!
//! - [`proto`] - generated messages and the two gRPC services:
//!   `TokenProviderService` (unary, served by plugins) and
//!   `PluginStreamService` (bidirectional, served by the controller).
//! - [`error`] - the RPC-layer [`Error`] and its mapping to
//!   [`tonic::Status`].
//! - [`types`] - protocol constants and timestamp conversions.

mod common;
pub use common::*;

/// Generated protobuf messages and gRPC bindings for `tokenrenewer.v1`.
pub mod proto {
    tonic::include_proto!("tokenrenewer.v1");

    /// Encoded file descriptor set, registered with gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/token_renewer_descriptor.bin"));
}
