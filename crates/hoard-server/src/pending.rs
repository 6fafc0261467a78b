//! Bookkeeping for in-flight fetches and announced transfers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use hoard_proto::RequestId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A peer's answer to a `GetFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The peer served the file and it is now in the local store.
    Stored {
        /// Serving peer
        from: String,
        /// Plaintext bytes written
        bytes: u64,
    },
    /// The peer does not have the file, or the transfer failed.
    Missing {
        /// Answering peer
        from: String,
    },
}

struct PendingRequest {
    key: String,
    tx: mpsc::UnboundedSender<FetchOutcome>,
}

/// Outstanding `GetFile` requests by correlation id.
pub struct PendingRequests {
    next_id: AtomicU64,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            // Ids must not repeat across restarts of the same node.
            next_id: AtomicU64::new(rand::random::<u32>() as u64),
            requests: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingRequests {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request for `key` and returns its id and the outcome
    /// receiver.
    pub fn register(&self, key: impl Into<String>) -> (RequestId, mpsc::UnboundedReceiver<FetchOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests.lock().insert(
            id,
            PendingRequest {
                key: key.into(),
                tx,
            },
        );
        (id, rx)
    }

    /// Returns true if `id` is waiting for `key`.
    pub fn is_waiting(&self, id: RequestId, key: &str) -> bool {
        self.requests
            .lock()
            .get(&id)
            .map(|req| req.key == key)
            .unwrap_or(false)
    }

    /// Delivers an outcome. Returns false if nobody waits for it.
    pub fn notify(&self, id: RequestId, key: &str, outcome: FetchOutcome) -> bool {
        let requests = self.requests.lock();
        match requests.get(&id) {
            Some(req) if req.key == key => req.tx.send(outcome).is_ok(),
            _ => false,
        }
    }

    /// Delivers a final outcome and retires the request under the same
    /// lock. Later replies for `id` find nobody waiting. Returns false if
    /// the request was already gone.
    pub fn complete(&self, id: RequestId, key: &str, outcome: FetchOutcome) -> bool {
        let mut requests = self.requests.lock();
        match requests.get(&id) {
            Some(req) if req.key == key => {
                let delivered = req.tx.send(outcome).is_ok();
                requests.remove(&id);
                delivered
            }
            _ => false,
        }
    }

    /// Forgets a request.
    pub fn remove(&self, id: RequestId) {
        self.requests.lock().remove(&id);
    }

    /// Returns the number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

/// A stream frame a peer has announced but not yet sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransfer {
    /// Hashed key
    pub key: String,
    /// Announced stream length, IV included
    pub size: u64,
    /// Set when the transfer answers one of our `GetFile`s
    pub request_id: Option<RequestId>,
}

/// Announced transfers per peer, in arrival order.
///
/// A peer's stream frames arrive in the same order as the control frames
/// that announced them, so each stream pairs with the oldest entry.
#[derive(Debug, Default)]
pub struct TransferQueue {
    queues: HashMap<String, VecDeque<InboundTransfer>>,
}

impl TransferQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement from `peer`.
    pub fn push(&mut self, peer: &str, transfer: InboundTransfer) {
        self.queues.entry(peer.to_string()).or_default().push_back(transfer);
    }

    /// Takes the oldest announcement from `peer`.
    pub fn pop(&mut self, peer: &str) -> Option<InboundTransfer> {
        let queue = self.queues.get_mut(peer)?;
        let transfer = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(peer);
        }
        transfer
    }

    /// Drops everything announced by `peer`.
    pub fn forget(&mut self, peer: &str) -> usize {
        self.queues.remove(peer).map(|q| q.len()).unwrap_or(0)
    }

    /// Returns the number of announcements waiting for a stream.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_notify() {
        let pending = PendingRequests::new();
        let (id, mut rx) = pending.register("abc");
        let (other, _rx2) = pending.register("abc");
        assert_ne!(id, other);
        assert_eq!(pending.len(), 2);

        let stored = FetchOutcome::Stored {
            from: "127.0.0.1:3000".to_string(),
            bytes: 10,
        };
        assert!(pending.notify(id, "abc", stored.clone()));
        assert_eq!(rx.recv().await, Some(stored));

        pending.remove(id);
        assert!(!pending.notify(id, "abc", FetchOutcome::Missing { from: "x".to_string() }));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_key_must_match() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register("abc");

        assert!(pending.is_waiting(id, "abc"));
        assert!(!pending.is_waiting(id, "def"));
        assert!(!pending.notify(id, "def", FetchOutcome::Missing { from: "x".to_string() }));
    }

    #[tokio::test]
    async fn test_complete_retires_request() {
        let pending = PendingRequests::new();
        let (id, mut rx) = pending.register("abc");

        let first = FetchOutcome::Stored {
            from: "127.0.0.1:3000".to_string(),
            bytes: 10,
        };
        assert!(!pending.complete(id, "def", first.clone()));
        assert!(pending.complete(id, "abc", first.clone()));
        assert!(!pending.is_waiting(id, "abc"));
        assert!(pending.is_empty());

        // A second server answering the same request is not delivered.
        let second = FetchOutcome::Stored {
            from: "127.0.0.1:3001".to_string(),
            bytes: 10,
        };
        assert!(!pending.complete(id, "abc", second));
        assert_eq!(rx.recv().await, Some(first));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_dropped_receiver() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register("abc");
        drop(rx);
        assert!(!pending.notify(id, "abc", FetchOutcome::Missing { from: "x".to_string() }));
    }

    #[test]
    fn test_transfer_queue_fifo() {
        let mut queue = TransferQueue::new();
        let first = InboundTransfer {
            key: "a".to_string(),
            size: 20,
            request_id: None,
        };
        let second = InboundTransfer {
            key: "b".to_string(),
            size: 30,
            request_id: Some(7),
        };

        queue.push("p1", first.clone());
        queue.push("p1", second.clone());
        queue.push("p2", first.clone());
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop("p1"), Some(first.clone()));
        assert_eq!(queue.pop("p1"), Some(second));
        assert_eq!(queue.pop("p1"), None);
        assert_eq!(queue.pop("unknown"), None);

        assert_eq!(queue.forget("p2"), 1);
        assert!(queue.is_empty());
    }
}
