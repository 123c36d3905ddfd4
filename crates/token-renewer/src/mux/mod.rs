//! Request/response multiplexing over a single bidirectional plugin stream.
//!
//! The controller is the gRPC server, but on a plugin stream it is also the
//! RPC *client*: it writes request frames and the plugin answers with
//! response frames carrying the same correlation id.

mod service;
mod session;
mod table;

pub use service::{PluginStreamHandler, SessionConfig};
pub use session::{Outbound, Session};
