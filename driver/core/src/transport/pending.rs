//! Pending Request Table
//!
//! Caller-side bookkeeping for in-flight requests. Ids are handed out from a
//! monotonic counter and every entry is removed exactly once: by its matching
//! response, or by [`PendingRequests::reject_all`] when the transport fails.
//! Once rejected, the table stays closed and new registrations fail
//! immediately with the same error.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::messages::RequestId;
use super::TransportError;

type Waiter<T> = oneshot::Sender<Result<T, TransportError>>;

/// Receiver half handed to the caller that registered a request
pub type PendingReply<T> = oneshot::Receiver<Result<T, TransportError>>;

/// Id-keyed table of callers waiting for a reply
#[derive(Debug)]
pub struct PendingRequests<T> {
    next_id: AtomicU64,
    entries: DashMap<RequestId, Waiter<T>>,
    closed: Mutex<Option<TransportError>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    /// Create an empty, open table (first id is 1)
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            closed: Mutex::new(None),
        }
    }

    /// Allocate an id and a receiver for its reply
    ///
    /// # Errors
    ///
    /// Returns the rejection error if the table has been closed.
    pub fn register(&self) -> Result<(RequestId, PendingReply<T>), TransportError> {
        let closed = self.closed.lock();
        if let Some(ref err) = *closed {
            return Err(err.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        Ok((id, rx))
    }

    /// Deliver `value` to the caller waiting on `id`
    ///
    /// Returns `false` if no such request is pending.
    pub fn resolve(&self, id: RequestId, value: T) -> bool {
        match self.entries.remove(&id) {
            Some((_, waiter)) => {
                // The caller may have stopped waiting; that is not our problem
                let _ = waiter.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Fail the request `id`
    ///
    /// Returns `false` if no such request is pending.
    pub fn reject(&self, id: RequestId, err: TransportError) -> bool {
        match self.entries.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `err` and close the table
    ///
    /// Returns how many requests were rejected. Only the first call's error
    /// is kept for later registrations.
    pub fn reject_all(&self, err: TransportError) -> usize {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(err.clone());
        }
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, waiter)) = self.entries.remove(&id) {
                let _ = waiter.send(Err(err.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    /// Number of requests still waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the table has been closed by [`reject_all`](Self::reject_all)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic_and_unique() {
        let table: PendingRequests<u32> = PendingRequests::new();
        let (a, _ra) = table.register().unwrap();
        let (b, _rb) = table.register().unwrap();
        let (c, _rc) = table.register().unwrap();
        assert!(a < b && b < c);
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_out_of_order() {
        let table: PendingRequests<&'static str> = PendingRequests::new();
        let (first, first_rx) = table.register().unwrap();
        let (second, second_rx) = table.register().unwrap();

        assert!(table.resolve(second, "two"));
        assert!(table.resolve(first, "one"));
        assert!(!table.resolve(first, "again"));

        assert_eq!(first_rx.await.unwrap(), Ok("one"));
        assert_eq!(second_rx.await.unwrap(), Ok("two"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reply_stays_pending_until_resolved() {
        let table: PendingRequests<u32> = PendingRequests::new();
        let (id, rx) = table.register().unwrap();
        let mut reply = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(reply.poll());

        assert!(table.resolve(id, 7));
        assert!(reply.is_woken());
        assert_eq!(tokio_test::assert_ready!(reply.poll()).unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_reject_all_clears_and_closes() {
        let table: PendingRequests<()> = PendingRequests::new();
        let receivers: Vec<_> = (0..4).map(|_| table.register().unwrap().1).collect();

        let err = TransportError::ContextTerminated("engine panicked".to_string());
        assert_eq!(table.reject_all(err.clone()), 4);
        assert!(table.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(err.clone()));
        }
        assert_eq!(table.register().unwrap_err(), err);
        assert!(table.is_closed());
    }

    #[tokio::test]
    async fn test_reject_single() {
        let table: PendingRequests<()> = PendingRequests::new();
        let (id, rx) = table.register().unwrap();
        assert!(table.reject(id, TransportError::ConnectionClosed));
        assert_eq!(rx.await.unwrap(), Err(TransportError::ConnectionClosed));
        assert!(!table.is_closed());
    }
}
