//! Correlation-id bookkeeping for in-flight RPC requests.
//!
//! One tracker exists per connection instance: ids restart at 1 on every
//! reconnect, which is safe because every pending request is failed before
//! the old connection is abandoned. Each entry holds a one-shot result
//! slot fulfilled exactly once -- by a matching response, a timeout sweep,
//! or a connection-wide `fail_all`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;

/// Result delivered to a waiting caller.
pub type RpcOutcome = Result<Value, Error>;

/// Default per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A request awaiting its response.
///
/// `method` and `params` are retained so an auth challenge can resubmit
/// the original request under a fresh id without involving the caller.
pub struct PendingRequest {
    pub method: String,
    pub params: Option<Value>,
    tx: oneshot::Sender<RpcOutcome>,
    sent_at: Instant,
}

impl PendingRequest {
    /// Consume the entry, delivering a failure to its caller.
    pub fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// Tracks pending requests for one connection instance.
pub struct RequestTracker {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    timeout: Duration,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Allocate an id and store a pending entry wired to the returned
    /// receiver. Ids are monotonically increasing and never reused while
    /// still pending.
    pub fn register(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> (u64, oneshot::Receiver<RpcOutcome>) {
        let (tx, rx) = oneshot::channel();
        let id = self.register_with(method, params, tx);
        (id, rx)
    }

    /// Like [`register`](Self::register), but fulfilling a caller-supplied
    /// result slot.
    pub fn register_with(
        &mut self,
        method: &str,
        params: Option<Value>,
        tx: oneshot::Sender<RpcOutcome>,
    ) -> u64 {
        self.insert(PendingRequest {
            method: method.to_string(),
            params,
            tx,
            sent_at: Instant::now(),
        })
    }

    /// Remove an entry without resolving it, for auth resubmission.
    pub fn take(&mut self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Re-enqueue a taken entry under a fresh id, preserving its creation
    /// time so the request timeout still measures from the original send.
    pub fn resubmit(&mut self, entry: PendingRequest) -> u64 {
        self.insert(entry)
    }

    fn insert(&mut self, entry: PendingRequest) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(id, entry);
        id
    }

    /// Peek at the method of a pending entry.
    pub fn method(&self, id: u64) -> Option<&str> {
        self.pending.get(&id).map(|entry| entry.method.as_str())
    }

    /// Deliver a result to the caller waiting on `id`.
    ///
    /// Unknown ids are stale or duplicate responses: logged and discarded,
    /// never an error. Returns `true` when an entry existed.
    pub fn resolve(&mut self, id: u64, outcome: RpcOutcome) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                // The caller may have given up; a dead receiver is fine.
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(id, "response for unknown request id, discarding");
                false
            }
        }
    }

    /// Fail every entry older than the request timeout.
    ///
    /// Each timed-out caller receives exactly one `RequestTimeout`; the
    /// entry is removed before delivery, so a late response afterwards is
    /// discarded as unknown.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                tracing::warn!(id, method = %entry.method, "request timed out");
                let _ = entry.tx.send(Err(Error::RequestTimeout {
                    timeout_secs: timeout.as_secs(),
                }));
            }
        }
        expired.len()
    }

    /// Fail every pending entry, e.g. on disconnect or shutdown.
    ///
    /// Callers never hang across a reconnect: the error produced by
    /// `make_error` is delivered to each of them.
    pub fn fail_all(&mut self, make_error: impl Fn() -> Error) -> usize {
        let count = self.pending.len();
        for (id, entry) in self.pending.drain() {
            tracing::debug!(id, method = %entry.method, "failing pending request");
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::{REQUEST_TIMEOUT, RequestTracker};
    use crate::error::Error;

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let mut tracker = RequestTracker::new();
        let (a, _rx_a) = tracker.register("Shelly.GetStatus", None);
        let (b, _rx_b) = tracker.register("Light.Set", Some(json!({"id": 0, "on": true})));
        let (c, _rx_c) = tracker.register("Shelly.Reboot", None);

        assert!(a < b && b < c);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_matching_caller() {
        let mut tracker = RequestTracker::new();
        let (id, rx) = tracker.register("Shelly.GetStatus", None);

        assert!(tracker.resolve(id, Ok(json!({"light:0": {"output": true}}))));
        let outcome = rx.await.expect("slot fulfilled");
        assert_eq!(outcome.expect("ok")["light:0"]["output"], true);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_discarded() {
        let mut tracker = RequestTracker::new();
        let (_id, _rx) = tracker.register("Shelly.GetStatus", None);

        assert!(!tracker.resolve(999, Ok(json!({}))));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_old_requests_exactly_once() {
        let mut tracker = RequestTracker::new();
        let (id, mut rx) = tracker.register("Light.Set", None);

        // Young request: untouched.
        assert_eq!(tracker.sweep(Instant::now()), 0);
        assert!(rx.try_recv().is_err());

        tokio::time::advance(REQUEST_TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(tracker.sweep(Instant::now()), 1);

        match rx.await.expect("slot fulfilled") {
            Err(Error::RequestTimeout { timeout_secs }) => assert_eq!(timeout_secs, 10),
            other => panic!("expected timeout, got {other:?}"),
        }

        // A late response after the timeout is a stale id, not a second delivery.
        assert!(!tracker.resolve(id, Ok(json!({}))));
        assert_eq!(tracker.sweep(Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_spares_requests_younger_than_the_timeout() {
        let mut tracker = RequestTracker::with_timeout(Duration::from_secs(10));
        let (_old, mut old_rx) = tracker.register("Shelly.GetStatus", None);

        tokio::time::advance(Duration::from_secs(6)).await;
        let (_young, mut young_rx) = tracker.register("Light.Set", None);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(tracker.sweep(Instant::now()), 1);

        assert!(old_rx.try_recv().is_ok());
        assert!(young_rx.try_recv().is_err());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_entry() {
        let mut tracker = RequestTracker::new();
        let receivers: Vec<_> = (0..5)
            .map(|_| tracker.register("Light.Set", None).1)
            .collect();

        assert_eq!(tracker.fail_all(|| Error::ConnectionLost), 5);
        assert_eq!(tracker.pending_count(), 0);

        for rx in receivers {
            match rx.await.expect("slot fulfilled") {
                Err(Error::ConnectionLost) => {}
                other => panic!("expected connection lost, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn take_and_resubmit_keeps_the_caller_wired() {
        let mut tracker = RequestTracker::new();
        let (id, rx) = tracker.register("Shelly.GetStatus", None);

        let entry = tracker.take(id).expect("entry exists");
        assert_eq!(entry.method, "Shelly.GetStatus");
        let new_id = tracker.resubmit(entry);
        assert_ne!(id, new_id);

        // The original id is gone; the new one still reaches the caller.
        assert!(!tracker.resolve(id, Ok(json!(1))));
        assert!(tracker.resolve(new_id, Ok(json!(2))));
        assert_eq!(rx.await.expect("slot fulfilled").expect("ok"), json!(2));
    }
}
