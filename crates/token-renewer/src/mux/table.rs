//! Correlation of outstanding calls with their responses.
//!
//! Every entry is removed exactly once: by the response that completes it, by
//! the caller giving up, by the deadline sweep, or by session teardown. All of
//! these go through the same lock, so whichever comes first wins and the
//! others find nothing.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use token_renewer_tonic_core::{Error, Result, proto::Method};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type ResponseSender = oneshot::Sender<Result<Bytes>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Bytes>>;

#[derive(Debug)]
struct OutstandingCall {
    method: Method,
    deadline: Instant,
    // One slot, so delivering never blocks the reader even if the caller is
    // already gone.
    tx: ResponseSender,
}

#[derive(Debug, Default)]
struct TableState {
    calls: HashMap<u64, OutstandingCall>,
    closed: Option<Error>,
}

#[derive(Debug)]
pub(crate) struct CorrelationTable {
    next_id: AtomicU64,
    state: Mutex<TableState>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TableState::default()),
        }
    }

    /// Allocates a correlation id and records the call.
    ///
    /// # Errors
    ///
    /// Returns the teardown error once the table has been closed.
    pub(crate) fn register(
        &self,
        method: Method,
        deadline: Instant,
    ) -> Result<(u64, ResponseReceiver)> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.calls.insert(
            id,
            OutstandingCall {
                method,
                deadline,
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Delivers `result` to the call registered under `id`.
    ///
    /// Returns `false` when no such call is outstanding, which is the normal
    /// fate of a response that arrives after its caller timed out.
    pub(crate) fn complete(&self, id: u64, result: Result<Bytes>) -> bool {
        let call = self.state.lock().calls.remove(&id);
        match call {
            Some(call) => {
                // The receiver may have been dropped in the meantime.
                let _ = call.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Forgets a call without delivering anything.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        self.state.lock().calls.remove(&id).is_some()
    }

    /// Closes the table and fails every outstanding call with `err`.
    ///
    /// Only the first close takes effect; later calls return 0.
    pub(crate) fn fail_all(&self, err: Error) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return 0;
            }
            state.closed = Some(err.clone());
            state.calls.drain().collect()
        };

        let failed = drained.len();
        for (_, call) in drained {
            let _ = call.tx.send(Err(err.clone()));
        }
        failed
    }

    /// Fails every call whose deadline is at or before `now` with
    /// [`Error::DeadlineExceeded`].
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = expired.len();
        for (id, call) in expired {
            tracing::debug!(
                correlation_id = id,
                method = call.method.rpc_name(),
                "Expiring outstanding call"
            );
            let _ = call.tx.send(Err(Error::DeadlineExceeded));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let table = CorrelationTable::new();
        let (a, _ra) = table.register(Method::RenewToken, far()).unwrap();
        let (b, _rb) = table.register(Method::RenewToken, far()).unwrap();
        assert!(b > a);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn completion_reaches_only_its_caller() {
        let table = CorrelationTable::new();
        let (a, ra) = table.register(Method::RenewToken, far()).unwrap();
        let (b, rb) = table.register(Method::GetTokenValidity, far()).unwrap();

        assert!(table.complete(b, Ok(Bytes::from_static(b"bee"))));
        assert!(table.complete(a, Ok(Bytes::from_static(b"ay"))));

        assert_eq!(ra.await.unwrap().unwrap(), Bytes::from_static(b"ay"));
        assert_eq!(rb.await.unwrap().unwrap(), Bytes::from_static(b"bee"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register(Method::RenewToken, far()).unwrap();
        drop(rx);
        assert!(table.cancel(id));
        assert!(!table.complete(id, Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn completing_after_receiver_dropped_does_not_block() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register(Method::RenewToken, far()).unwrap();
        drop(rx);
        assert!(table.complete(id, Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn fail_all_is_exactly_once() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (0..5)
            .map(|_| table.register(Method::RenewToken, far()).unwrap().1)
            .collect();

        let err = Error::Disconnected {
            provider: "p".into(),
        };
        assert_eq!(table.fail_all(err.clone()), 5);
        assert_eq!(table.fail_all(Error::DeadlineExceeded), 0);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(err.clone()));
        }
        assert!(table.is_closed());
        assert_eq!(
            table.register(Method::RenewToken, far()).unwrap_err(),
            err
        );
    }

    #[tokio::test]
    async fn expire_only_touches_overdue_calls() {
        let table = CorrelationTable::new();
        let now = Instant::now();
        let (_, overdue) = table.register(Method::RenewToken, now).unwrap();
        let (_, pending) = table.register(Method::RenewToken, far()).unwrap();

        assert_eq!(table.expire(now), 1);
        assert_eq!(overdue.await.unwrap(), Err(Error::DeadlineExceeded));
        assert_eq!(table.len(), 1);
        drop(pending);
    }
}
