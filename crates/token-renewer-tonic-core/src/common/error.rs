//! Error types for the provider RPC layer.
//!
//! This module defines the central `Error` enum, which captures every way a
//! call to a provider plugin can fail, independent of the transport carrying
//! it. It implements `From<Error>` for `tonic::Status` so failures can be
//! reported back over gRPC, and `From<tonic::Status>` so unary client errors
//! fold into the same taxonomy.
//!
//! ## Error Cases
//! - `DeadlineExceeded`: the caller's deadline (or the per-call bound) fired.
//! - `Cancelled`: the caller's context was cancelled.
//! - `Disconnected`: the provider was unregistered while the call was pending.
//! - `SessionClosed`: the stream carrying the call ended.
//! - `Remote`: the provider answered with an error.
//! - `Transport`: any other gRPC status returned by a unary provider.
//! - `Decode`: a response payload was not a valid protobuf message.
//! - `InvalidFrame`: the peer sent a frame that violates the stream protocol.
//! - `Handshake`: the first stream frame was not a valid registration.
//! - `ChannelError`: an internal queue was closed.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for provider calls.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// The call did not complete before its deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The calling context was cancelled.
    #[error("Call cancelled")]
    Cancelled,

    /// The provider was removed from the registry while the call was pending.
    #[error("Provider {provider} disconnected")]
    Disconnected { provider: String },

    /// The multiplexed stream carrying the call has ended.
    #[error("Session closed: {reason}")]
    SessionClosed { reason: String },

    /// The provider processed the call and reported a failure.
    #[error("Provider error: {message}")]
    Remote { message: String },

    /// A gRPC status not covered by the other variants.
    #[error("Transport error ({code:?}): {message}")]
    Transport { code: Code, message: String },

    /// A response payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The peer violated the stream protocol.
    #[error("Invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// The registration handshake failed.
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    /// Returns `true` when the call failed because its provider went away,
    /// either through unregistration or because the stream closed.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::SessionClosed { .. })
    }

    /// Returns `true` when the call hit its deadline.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::DeadlineExceeded => Self::DeadlineExceeded,
            Code::Cancelled => Self::Cancelled,
            code => Self::Transport {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::DeadlineExceeded => Status::deadline_exceeded("Deadline exceeded"),
            Error::Cancelled => Status::cancelled("Call was cancelled"),
            Error::Disconnected { provider } => {
                Status::unavailable(format!("Provider {provider} disconnected"))
            }
            Error::SessionClosed { reason } => {
                Status::unavailable(format!("Session closed: {reason}"))
            }
            Error::Remote { message } => Status::unknown(message),
            Error::Transport { code, message } => Status::new(code, message),
            Error::Decode(e) => Status::internal(format!("Decode error: {e}")),
            Error::InvalidFrame { reason } => Status::invalid_argument(reason),
            Error::Handshake { reason } => Status::invalid_argument(reason),
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_fold_into_timeout_and_cancel() {
        assert_eq!(
            Error::from(Status::deadline_exceeded("slow")),
            Error::DeadlineExceeded
        );
        assert_eq!(Error::from(Status::cancelled("bye")), Error::Cancelled);
        assert_eq!(
            Error::from(Status::not_found("nope")),
            Error::Transport {
                code: Code::NotFound,
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn disconnect_covers_both_teardown_paths() {
        assert!(
            Error::Disconnected {
                provider: "linode".into()
            }
            .is_disconnect()
        );
        assert!(
            Error::SessionClosed {
                reason: "eof".into()
            }
            .is_disconnect()
        );
        assert!(!Error::DeadlineExceeded.is_disconnect());
    }

    #[test]
    fn handshake_errors_are_invalid_argument() {
        let status = Status::from(Error::Handshake {
            reason: "empty name".into(),
        });
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
