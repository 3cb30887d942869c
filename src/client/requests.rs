//! Tracking of outstanding reads and writes.
//!
//! Every request gets an id from one per-context counter. Each id completes at
//! most once: by its response, by a local cancel, or by circuit loss.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    client::{ChannelId, ClientError, RequestId, circuit::CircuitId},
    dbr::Dbr,
    utils::wrapping_inplace_add,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// READ_NOTIFY
    Read,
    /// WRITE_NOTIFY
    Write,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Read => "Read",
            RequestKind::Write => "Write",
        })
    }
}

/// A successful completion
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Read(Dbr),
    Written,
}

pub type Completion = Box<dyn FnOnce(Result<Response, ClientError>) + Send>;

pub(crate) struct PendingRequest {
    pub kind: RequestKind,
    pub channel: ChannelId,
    pub channel_name: String,
    pub circuit: CircuitId,
    pub issued_at: Instant,
    callback: Completion,
}

impl PendingRequest {
    pub fn finish(self, result: Result<Response, ClientError>) {
        (self.callback)(result)
    }
}

#[derive(Default)]
struct TrackerState {
    next_id: u32,
    pending: HashMap<RequestId, PendingRequest>,
}

#[derive(Default)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

impl RequestTracker {
    pub fn new() -> Self {
        RequestTracker::default()
    }

    /// Register a request and return its id. IDs still outstanding after a
    /// wraparound are skipped.
    pub fn issue(
        &self,
        circuit: CircuitId,
        channel: ChannelId,
        channel_name: &str,
        kind: RequestKind,
        callback: Completion,
    ) -> RequestId {
        let mut state = self.state.lock();
        let id = loop {
            let id = RequestId(wrapping_inplace_add(&mut state.next_id));
            if !state.pending.contains_key(&id) {
                break id;
            }
        };
        state.pending.insert(
            id,
            PendingRequest {
                kind,
                channel,
                channel_name: channel_name.to_string(),
                circuit,
                issued_at: Instant::now(),
                callback,
            },
        );
        id
    }

    /// Remove a request so the caller can validate and finish it
    pub(crate) fn take(&self, id: RequestId) -> Option<PendingRequest> {
        self.state.lock().pending.remove(&id)
    }

    /// Deliver a result. Unknown ids (late or duplicate replies) are dropped.
    pub fn complete(&self, id: RequestId, result: Result<Response, ClientError>) -> bool {
        match self.take(id) {
            Some(request) => {
                request.finish(result);
                true
            }
            None => {
                debug!("Dropping completion for unknown request {id}");
                false
            }
        }
    }

    /// Forget a request without calling it back
    pub fn cancel(&self, id: RequestId) -> bool {
        self.take(id).is_some()
    }

    /// Fail every request on a circuit with a disconnect error
    pub fn cancel_all(&self, circuit: CircuitId) -> usize {
        let cancelled: Vec<_> = {
            let mut state = self.state.lock();
            let ids: Vec<_> = state
                .pending
                .iter()
                .filter(|(_, r)| r.circuit == circuit)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id))
                .collect()
        };
        let count = cancelled.len();
        for request in cancelled {
            let error = ClientError::Disconnected {
                channel: request.channel_name.clone(),
                kind: request.kind,
            };
            request.finish(Err(error));
        }
        count
    }

    /// Fail every request for one channel with the error `make_error` builds
    pub(crate) fn cancel_channel(
        &self,
        channel: ChannelId,
        make_error: impl Fn(RequestKind, &str) -> ClientError,
    ) {
        let cancelled: Vec<_> = {
            let mut state = self.state.lock();
            let ids: Vec<_> = state
                .pending
                .iter()
                .filter(|(_, r)| r.channel == channel)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id))
                .collect()
        };
        for request in cancelled {
            let error = make_error(request.kind, &request.channel_name);
            request.finish(Err(error));
        }
    }

    /// Requests outstanding for longer than `older_than`
    pub fn stale(&self, older_than: Duration) -> Vec<(RequestId, RequestKind, String, Duration)> {
        let now = Instant::now();
        self.state
            .lock()
            .pending
            .iter()
            .filter(|(_, r)| now.duration_since(r.issued_at) > older_than)
            .map(|(id, r)| {
                (
                    *id,
                    r.kind,
                    r.channel_name.clone(),
                    now.duration_since(r.issued_at),
                )
            })
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use proptest::prelude::*;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> Completion {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn completes_once() {
        let tracker = RequestTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = tracker.issue(
            CircuitId(1),
            ChannelId(1),
            "A",
            RequestKind::Read,
            counting(&count),
        );
        assert!(tracker.complete(id, Ok(Response::Written)));
        assert!(!tracker.complete(id, Ok(Response::Written)));
        assert_eq!(tracker.cancel_all(CircuitId(1)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_all_reports_disconnect() {
        let tracker = RequestTracker::new();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        tracker.issue(
            CircuitId(3),
            ChannelId(9),
            "TEST:PV",
            RequestKind::Write,
            Box::new(move |r| *slot.lock() = Some(r)),
        );
        tracker.issue(
            CircuitId(4),
            ChannelId(9),
            "OTHER",
            RequestKind::Read,
            Box::new(|_| panic!("Wrong circuit cancelled")),
        );
        assert_eq!(tracker.cancel_all(CircuitId(3)), 1);
        assert_eq!(
            result.lock().take(),
            Some(Err(ClientError::Disconnected {
                channel: "TEST:PV".into(),
                kind: RequestKind::Write
            }))
        );
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn wraparound_skips_outstanding() {
        let tracker = RequestTracker::new();
        tracker.state.lock().next_id = u32::MAX;
        let first = tracker.issue(CircuitId(0), ChannelId(0), "", RequestKind::Read, Box::new(|_| ()));
        assert_eq!(first, RequestId(u32::MAX));
        let zero = tracker.issue(CircuitId(0), ChannelId(0), "", RequestKind::Read, Box::new(|_| ()));
        assert_eq!(zero, RequestId(0));
        // Wrap again with both still outstanding
        tracker.state.lock().next_id = u32::MAX;
        let next = tracker.issue(CircuitId(0), ChannelId(0), "", RequestKind::Read, Box::new(|_| ()));
        assert_eq!(next, RequestId(1));
    }

    #[test]
    fn stale_requests_are_reported_not_failed() {
        let tracker = RequestTracker::new();
        tracker.issue(CircuitId(0), ChannelId(0), "SLOW", RequestKind::Read, Box::new(|_| ()));
        std::thread::sleep(Duration::from_millis(5));
        let stale = tracker.stale(Duration::from_millis(1));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].2, "SLOW");
        assert_eq!(tracker.outstanding(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Issue(u8),
        Complete(u8),
        Cancel(u8),
        CancelAll(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3).prop_map(Op::Issue),
            (0u8..16).prop_map(Op::Complete),
            (0u8..16).prop_map(Op::Cancel),
            (0u8..3).prop_map(Op::CancelAll),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_delivery(ops in prop::collection::vec(op(), 0..64)) {
            let tracker = RequestTracker::new();
            let mut counters = Vec::new();
            let mut ids = Vec::new();
            for op in ops {
                match op {
                    Op::Issue(circuit) => {
                        let counter = Arc::new(AtomicUsize::new(0));
                        ids.push(tracker.issue(
                            CircuitId(circuit as u64),
                            ChannelId(0),
                            "P",
                            RequestKind::Read,
                            counting(&counter),
                        ));
                        counters.push(counter);
                    }
                    Op::Complete(n) => {
                        if let Some(id) = ids.get(n as usize) {
                            tracker.complete(*id, Ok(Response::Written));
                        }
                    }
                    Op::Cancel(n) => {
                        if let Some(id) = ids.get(n as usize) {
                            tracker.cancel(*id);
                        }
                    }
                    Op::CancelAll(circuit) => {
                        tracker.cancel_all(CircuitId(circuit as u64));
                    }
                }
            }
            for counter in &counters {
                prop_assert!(counter.load(Ordering::SeqCst) <= 1);
            }
        }
    }
}
