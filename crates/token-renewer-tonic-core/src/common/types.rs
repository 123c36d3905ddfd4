//! # Protocol constants and conversions
//!
//! Values both sides of the plugin protocol agree on, and the conversions
//! between [`SystemTime`] and the protobuf [`Timestamp`] used for expiration
//! times.

use crate::Error;
use crate::proto::Method;
use core::time::Duration;
use prost_types::Timestamp;
use std::time::SystemTime;

/// Upper bound applied to every provider call, on top of the caller's own
/// deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a freshly connected plugin has to send its registration frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Key under which a credential store entry holds the live credential.
pub const TOKEN_KEY: &str = "token";

/// Socket file extension used by plugins that serve the unary protocol.
pub const SOCKET_EXTENSION: &str = "sock";

/// Converts a wall-clock time into a protobuf timestamp.
pub fn to_timestamp(time: SystemTime) -> Timestamp {
    Timestamp::from(time)
}

/// Converts a required protobuf timestamp field into a wall-clock time.
///
/// # Errors
///
/// Returns [`Error::InvalidFrame`] when the field is absent or cannot be
/// represented as a [`SystemTime`].
pub fn from_timestamp(ts: Option<Timestamp>) -> Result<SystemTime, Error> {
    let ts = ts.ok_or_else(|| Error::InvalidFrame {
        reason: "missing expiration timestamp".to_string(),
    })?;
    SystemTime::try_from(ts).map_err(|e| Error::InvalidFrame {
        reason: format!("invalid expiration timestamp: {e}"),
    })
}

impl Method {
    /// Human-readable RPC name used in logs.
    pub const fn rpc_name(self) -> &'static str {
        match self {
            Self::Unspecified => "Unspecified",
            Self::RenewToken => "RenewToken",
            Self::GetTokenValidity => "GetTokenValidity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_conversion_preserves_instant() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(from_timestamp(Some(to_timestamp(t))).unwrap(), t);
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        assert!(matches!(
            from_timestamp(None),
            Err(Error::InvalidFrame { .. })
        ));
    }
}
