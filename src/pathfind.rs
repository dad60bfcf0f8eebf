//! Path-find sessions
//!
//! The server supports a single path-find subscription at a time, so the
//! manager keeps one active session and a FIFO queue of waiting requests.
//! Closing the active session promotes the next queued request; the
//! displaced session learns it was superseded exactly at promotion time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::address::Address;

/// Parameters of one path-find request.
#[derive(Debug, Clone)]
pub struct PathFindRequest {
    pub source: Address,
    pub destination: Address,
    /// Destination amount, in the wire's amount encoding.
    pub amount: Value,
}

/// One path-find conversation with the network.
#[derive(Debug)]
pub struct PathFindSession {
    id: u64,
    request: PathFindRequest,
    updates: broadcast::Sender<Arc<Value>>,
    superseded: AtomicBool,
    closed: AtomicBool,
}

impl PathFindSession {
    fn new(id: u64, request: PathFindRequest) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            id,
            request,
            updates,
            superseded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &PathFindRequest {
        &self.request
    }

    /// Subscribe to path updates for this session.
    pub fn updates(&self) -> broadcast::Receiver<Arc<Value>> {
        self.updates.subscribe()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn deliver(&self, payload: Arc<Value>) {
        let _ = self.updates.send(payload);
    }

    /// Wire fields for the `path_find` create subcommand.
    pub(crate) fn create_fields(&self) -> Value {
        json!({
            "subcommand": "create",
            "source_account": self.request.source.as_str(),
            "destination_account": self.request.destination.as_str(),
            "destination_amount": self.request.amount,
        })
    }
}

/// Single active session plus FIFO queue.
#[derive(Debug, Default)]
pub struct PathFindManager {
    active: Mutex<Option<Arc<PathFindSession>>>,
    queue: Mutex<VecDeque<Arc<PathFindSession>>>,
    next_id: AtomicU64,
}

impl PathFindManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Returns the session and whether it became active
    /// immediately; a queued session starts when its turn comes.
    pub fn create(&self, request: PathFindRequest) -> (Arc<PathFindSession>, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(PathFindSession::new(id, request));
        let mut active = self.active.lock();
        if active.is_none() {
            *active = Some(session.clone());
            (session, true)
        } else {
            debug!(id = id, "queueing path-find behind active session");
            self.queue.lock().push_back(session.clone());
            (session, false)
        }
    }

    pub fn active(&self) -> Option<Arc<PathFindSession>> {
        self.active.lock().clone()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Close the active session. If a request is queued it is promoted and
    /// returned, and the closed session is told it has been superseded.
    pub fn close_active(&self) -> Option<Arc<PathFindSession>> {
        let mut active = self.active.lock();
        let previous = active.take()?;
        previous.mark_closed();
        if let Some(next) = self.queue.lock().pop_front() {
            previous.mark_superseded();
            *active = Some(next.clone());
            debug!(id = next.id(), "promoted queued path-find session");
            return Some(next);
        }
        None
    }

    /// Deliver an inbound path-find payload to the active session only.
    pub fn route(&self, payload: Arc<Value>) -> bool {
        match self.active.lock().as_ref() {
            Some(session) => {
                session.deliver(payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::encode_check;

    fn request(fill: u8) -> PathFindRequest {
        PathFindRequest {
            source: Address::parse(&encode_check(0, &[fill; 20])).unwrap(),
            destination: Address::parse(&encode_check(0, &[fill + 1; 20])).unwrap(),
            amount: json!("1000000"),
        }
    }

    #[test]
    fn second_request_queues_behind_active() {
        let manager = PathFindManager::new();
        let (first, started_first) = manager.create(request(1));
        let (second, started_second) = manager.create(request(3));

        assert!(started_first);
        assert!(!started_second);
        assert_eq!(manager.active().unwrap().id(), first.id());
        assert_eq!(manager.queued_len(), 1);
        assert!(!second.is_superseded());
    }

    #[test]
    fn closing_active_promotes_next_and_supersedes() {
        let manager = PathFindManager::new();
        let (first, _) = manager.create(request(1));
        let (second, _) = manager.create(request(3));

        let promoted = manager.close_active().unwrap();
        assert_eq!(promoted.id(), second.id());
        assert!(first.is_closed());
        assert!(first.is_superseded());
        assert_eq!(manager.active().unwrap().id(), second.id());
        assert_eq!(manager.queued_len(), 0);
    }

    #[test]
    fn closing_without_queue_leaves_no_active() {
        let manager = PathFindManager::new();
        let (first, _) = manager.create(request(1));
        assert!(manager.close_active().is_none());
        assert!(first.is_closed());
        // Closed without a replacement: not superseded.
        assert!(!first.is_superseded());
        assert!(manager.active().is_none());
    }

    #[tokio::test]
    async fn updates_reach_only_the_active_session() {
        let manager = PathFindManager::new();
        let (first, _) = manager.create(request(1));
        let (second, _) = manager.create(request(3));
        let mut first_rx = first.updates();
        let mut second_rx = second.updates();

        assert!(manager.route(Arc::new(json!({"alternatives": []}))));
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn create_fields_carry_the_request() {
        let manager = PathFindManager::new();
        let (session, _) = manager.create(request(9));
        let fields = session.create_fields();
        assert_eq!(fields["subcommand"], json!("create"));
        assert_eq!(
            fields["source_account"],
            json!(session.request().source.as_str())
        );
    }
}
