//! Table of in-flight correlated requests.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context as TaskContext, Poll},
    time::Instant,
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    context::ConnectionId,
    error::{CallError, LossReason},
    protocol::RequestId,
};

/// Outcome delivered to a waiting caller.
pub type CallOutcome = Result<Value, CallError>;

struct PendingRequest {
    connection: ConnectionId,
    created_at: Instant,
    reply: oneshot::Sender<CallOutcome>,
}

/// Requests awaiting a result, keyed by correlation id.
///
/// Every entry is settled at most once: settling removes it, and a removed
/// id can no longer be settled.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request sent on `connection`.
    ///
    /// # Errors
    /// Returns error if a request with the same id is still outstanding.
    pub fn register(
        &mut self,
        id: RequestId,
        connection: ConnectionId,
    ) -> Result<PendingReply, CallError> {
        if self.entries.contains_key(&id) {
            return Err(CallError::DuplicateRequest(id));
        }
        let (reply, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                connection,
                created_at: Instant::now(),
                reply,
            },
        );
        Ok(PendingReply { rx })
    }

    /// Resolve or reject one request. Returns false for unknown ids.
    pub fn settle(&mut self, id: &RequestId, outcome: CallOutcome) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        tracing::debug!(
            request_id = %id,
            elapsed_ms = entry.created_at.elapsed().as_millis(),
            ok = outcome.is_ok(),
            "Settled request"
        );
        if entry.reply.send(outcome).is_err() {
            tracing::debug!(request_id = %id, "Caller went away before settlement");
        }
        true
    }

    /// Drop a request without settling it (the caller already gave up).
    pub fn discard(&mut self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every request sent on `connection`.
    pub fn fail_connection(&mut self, connection: ConnectionId, reason: LossReason) -> usize {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.settle(id, Err(CallError::ConnectionLost(reason)));
        }
        ids.len()
    }

    /// Fail every outstanding request.
    pub fn fail_all(&mut self, reason: LossReason) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.reply.send(Err(CallError::ConnectionLost(reason)));
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future resolved when the matching request is settled.
#[must_use = "the reply resolves only when awaited"]
pub struct PendingReply {
    rx: oneshot::Receiver<CallOutcome>,
}

impl Future for PendingReply {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        // A dropped sender means the table went away with the connection.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::ConnectionLost(LossReason::Closed))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    const CONN_A: ConnectionId = ConnectionId::from_raw(1);
    const CONN_B: ConnectionId = ConnectionId::from_raw(2);

    #[test]
    fn test_settles_exactly_once() {
        let mut table = PendingTable::new();
        let id = RequestId::from("r1");
        let mut reply = task::spawn(table.register(id.clone(), CONN_A).unwrap());
        assert_pending!(reply.poll());

        assert!(table.settle(&id, Ok(json!({"status": "ok"}))));
        assert!(!table.settle(&id, Ok(json!({"status": "again"}))));
        assert!(table.is_empty());

        let outcome = assert_ready!(reply.poll());
        assert_eq!(outcome.unwrap(), json!({"status": "ok"}));
    }

    #[test]
    fn test_rejects_duplicate_outstanding_id() {
        let mut table = PendingTable::new();
        let id = RequestId::from("dup");
        let _first = table.register(id.clone(), CONN_A).unwrap();
        assert!(matches!(
            table.register(id.clone(), CONN_A),
            Err(CallError::DuplicateRequest(_))
        ));

        // Once settled, the id may be registered again.
        table.settle(&id, Ok(Value::Null));
        assert!(table.register(id, CONN_A).is_ok());
    }

    #[test]
    fn test_fail_connection_only_touches_its_requests() {
        let mut table = PendingTable::new();
        let mut a = task::spawn(table.register(RequestId::from("a"), CONN_A).unwrap());
        let mut b = task::spawn(table.register(RequestId::from("b"), CONN_B).unwrap());

        assert_eq!(table.fail_connection(CONN_A, LossReason::Superseded), 1);
        assert!(matches!(
            assert_ready!(a.poll()),
            Err(CallError::ConnectionLost(LossReason::Superseded))
        ));
        assert_pending!(b.poll());
        assert!(table.contains(&RequestId::from("b")));

        assert_eq!(table.fail_all(LossReason::ShuttingDown), 1);
        assert!(matches!(
            assert_ready!(b.poll()),
            Err(CallError::ConnectionLost(LossReason::ShuttingDown))
        ));
    }

    #[test]
    fn test_discard_leaves_late_result_as_noop() {
        let mut table = PendingTable::new();
        let id = RequestId::from("late");
        let reply = table.register(id.clone(), CONN_A).unwrap();
        drop(reply);

        assert!(table.discard(&id));
        assert!(!table.settle(&id, Ok(json!({"late": true}))));
    }
}
