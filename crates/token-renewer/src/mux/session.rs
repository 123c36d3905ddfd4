use super::table::CorrelationTable;
use crate::context::CallContext;
use crate::registry::Registry;
use bytes::Bytes;
use core::time::Duration;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use token_renewer_tonic_core::{
    Error, Result,
    proto::{
        Method, PluginStreamMessage, Registration, RpcRequest, RpcResponse,
        plugin_stream_message::Frame,
    },
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::Status;

/// Outbound half of a plugin stream as handed to tonic.
pub type Outbound = mpsc::Sender<core::result::Result<PluginStreamMessage, Status>>;

/// How often the reader sweeps calls whose caller stopped waiting without
/// cleaning up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One connected plugin speaking the multiplexed stream protocol.
///
/// Any number of tasks may [`call`](Session::call) concurrently. Requests are
/// queued on a single bounded outbound channel; responses are read by the one
/// task running [`Session::run`] and routed back by correlation id.
#[derive(Debug)]
pub struct Session {
    name: String,
    version: String,
    table: CorrelationTable,
    outbound: Outbound,
    closed: CancellationToken,
}

/// Removes the call's entry if the caller stops waiting before an answer.
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}

impl Session {
    /// Waits for the registration frame that must open every stream.
    ///
    /// # Errors
    ///
    /// [`Error::Handshake`] if the stream ends, errors, sends anything other
    /// than a registration, sends an empty name, or stays silent past
    /// `timeout`.
    pub async fn handshake<S>(inbound: &mut S, timeout: Duration) -> Result<Registration>
    where
        S: Stream<Item = core::result::Result<PluginStreamMessage, Status>> + Unpin,
    {
        let first = tokio::time::timeout(timeout, inbound.next())
            .await
            .map_err(|_| Error::Handshake {
                reason: format!("no registration within {timeout:?}"),
            })?;

        let msg = match first {
            Some(Ok(msg)) => msg,
            Some(Err(status)) => {
                return Err(Error::Handshake {
                    reason: format!("stream failed before registration: {status}"),
                });
            }
            None => {
                return Err(Error::Handshake {
                    reason: "stream ended before registration".to_string(),
                });
            }
        };

        match msg.frame {
            Some(Frame::Registration(reg)) if !reg.name.trim().is_empty() => Ok(Registration {
                name: reg.name.trim().to_string(),
                version: reg.version,
            }),
            Some(Frame::Registration(_)) => Err(Error::Handshake {
                reason: "registration has an empty name".to_string(),
            }),
            _ => Err(Error::Handshake {
                reason: "first frame is not a registration".to_string(),
            }),
        }
    }

    pub fn new(registration: Registration, outbound: Outbound) -> Arc<Self> {
        Arc::new(Self {
            name: registration.name,
            version: registration.version,
            table: CorrelationTable::new(),
            outbound,
            closed: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of calls waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Resolves once the session has been torn down.
    pub fn closed_owned(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }

    /// Sends one request and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::DeadlineExceeded`] / [`Error::Cancelled`] from `ctx`.
    /// - [`Error::Disconnected`] / [`Error::SessionClosed`] if the session is
    ///   torn down first.
    /// - [`Error::Remote`] if the plugin answered with an error.
    #[tracing::instrument(level = "debug", skip(self, payload, ctx), fields(provider = %self.name))]
    pub async fn call(&self, method: Method, payload: Bytes, ctx: &CallContext) -> Result<Bytes> {
        let (id, mut rx) = self.table.register(method, ctx.deadline())?;
        let _guard = PendingGuard {
            table: &self.table,
            id,
        };
        tracing::trace!(correlation_id = id, method = method.rpc_name(), "Sending request");

        let frame = PluginStreamMessage {
            frame: Some(Frame::Request(RpcRequest {
                correlation_id: id,
                method: method as i32,
                payload,
            })),
        };

        ctx.run(async {
            // A full outbound queue must not hide a teardown that already
            // answered this call.
            tokio::select! {
                biased;
                early = &mut rx => return early.unwrap_or_else(|_| Err(self.closed_error())),
                sent = self.outbound.send(Ok(frame)) => {
                    if sent.is_err() {
                        return Err(self.closed_error());
                    }
                }
            }
            rx.await.unwrap_or_else(|_| Err(self.closed_error()))
        })
        .await?
    }

    /// Tears the session down, failing every outstanding call with `err`.
    ///
    /// Returns the number of calls failed; repeated calls return 0.
    pub fn close(&self, err: Error) -> usize {
        self.closed.cancel();
        let failed = self.table.fail_all(err);
        if failed > 0 {
            tracing::debug!(provider = %self.name, failed, "Failed outstanding calls");
        }
        failed
    }

    /// Reads inbound frames until the stream ends, misbehaves, or the session
    /// is closed from the registry side, then tears down.
    pub async fn run<S>(self: Arc<Self>, mut inbound: S, registry: Registry)
    where
        S: Stream<Item = core::result::Result<PluginStreamMessage, Status>> + Unpin,
    {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => break "closed by controller".to_string(),
                _ = sweep.tick() => {
                    self.table.expire(Instant::now());
                }
                next = inbound.next() => match next {
                    None => break "stream ended".to_string(),
                    Some(Err(status)) => break format!("transport error: {status}"),
                    Some(Ok(msg)) => {
                        if let Err(e) = self.dispatch(msg) {
                            tracing::warn!(provider = %self.name, error = %e, "Dropping session");
                            break e.to_string();
                        }
                    }
                },
            }
        };

        tracing::info!(provider = %self.name, %reason, "Plugin session ended");
        self.close(Error::SessionClosed { reason });
        registry.unregister_session(&self.name, &self);
    }

    fn dispatch(&self, msg: PluginStreamMessage) -> Result<()> {
        match msg.frame {
            Some(Frame::Response(RpcResponse {
                correlation_id,
                payload,
                error,
            })) => {
                let result = if error.is_empty() {
                    Ok(payload)
                } else {
                    Err(Error::Remote { message: error })
                };
                if !self.table.complete(correlation_id, result) {
                    tracing::debug!(
                        provider = %self.name,
                        correlation_id,
                        "Discarding response with no outstanding call"
                    );
                }
                Ok(())
            }
            Some(Frame::Registration(_)) => Err(Error::InvalidFrame {
                reason: "duplicate registration".to_string(),
            }),
            Some(Frame::Request(_)) => Err(Error::InvalidFrame {
                reason: "request frame from provider".to_string(),
            }),
            None => Err(Error::InvalidFrame {
                reason: "frame has no body".to_string(),
            }),
        }
    }

    fn closed_error(&self) -> Error {
        Error::SessionClosed {
            reason: format!("session with {} is closed", self.name),
        }
    }
}
