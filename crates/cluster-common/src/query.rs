// Pending-query table: one-shot continuations for in-flight internal
// requests, keyed by the "<workerId>:<seq>" token.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::message::WorkerId;

/// What a reply delivers to the requester's continuation.
#[derive(Debug, Default)]
pub struct QueryReply {
    pub content: Option<Value>,
    pub error: Option<String>,
    pub handle: Option<OwnedFd>,
}

/// Per-process table of outstanding requests. The sequence is shared by
/// every exchange in the process, so tokens never repeat.
#[derive(Debug, Default)]
pub struct PendingQueries {
    seq: AtomicU64,
    inflight: Mutex<HashMap<String, oneshot::Sender<QueryReply>>>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a token scoped to the worker the exchange concerns and
    /// register its continuation.
    pub fn allocate(&self, worker: WorkerId) -> (String, oneshot::Receiver<QueryReply>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let token = format!("{}:{}", worker, seq);
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().insert(token.clone(), tx);
        (token, rx)
    }

    /// Resume and remove the continuation for `token`. Returns false for
    /// unsolicited echoes, which are dropped.
    pub fn complete(&self, token: &str, reply: QueryReply) -> bool {
        match self.inflight.lock().remove(token) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a continuation whose request never made it onto the wire.
    pub fn forget(&self, token: &str) {
        self.inflight.lock().remove(token);
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_resumes_continuation_exactly_once() {
        let queries = PendingQueries::new();
        let (token, rx) = queries.allocate(3);
        assert!(token.starts_with("3:"));

        assert!(queries.complete(&token, QueryReply::default()));
        assert!(rx.await.is_ok());

        // Second echo with the same token is unsolicited.
        assert!(!queries.complete(&token, QueryReply::default()));
        assert_eq!(queries.outstanding(), 0);
    }

    #[test]
    fn test_unsolicited_echo_is_dropped() {
        let queries = PendingQueries::new();
        assert!(!queries.complete("1:99", QueryReply::default()));
    }

    #[test]
    fn test_tokens_are_unique_across_workers() {
        let queries = PendingQueries::new();
        let (a, _rx_a) = queries.allocate(1);
        let (b, _rx_b) = queries.allocate(1);
        let (c, _rx_c) = queries.allocate(2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(queries.outstanding(), 3);
    }

    #[test]
    fn test_forget_clears_entry() {
        let queries = PendingQueries::new();
        let (token, mut rx) = queries.allocate(1);
        queries.forget(&token);
        assert_eq!(queries.outstanding(), 0);
        assert!(rx.try_recv().is_err());
    }
}
