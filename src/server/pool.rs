//! Server pool and request routing
//!
//! Owns the connection list and the primary designation, selects a server
//! per request, and carries the pending-response map. Requests issued while
//! offline are deferred behind the next connect event rather than dropped;
//! there is no retry and no per-request timeout at this layer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::connection::ServerConnection;
use crate::config::ServerEndpoint;
use crate::errors::{ConnectionError, RemoteError};
use crate::request::Request;

type ResponseSender = oneshot::Sender<Result<Value, RemoteError>>;

#[derive(Debug)]
struct DeferredSend {
    payload: Value,
    pin: Option<usize>,
}

/// A request in flight. Resolves through [`PendingRequest::result`]; an
/// explicit [`PendingRequest::abort`] resolves it with a connection error
/// instead of leaving it dangling.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RemoteError>>,
    pending: Arc<DashMap<u64, ResponseSender>>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the request. The result future resolves with
    /// [`ConnectionError::Aborted`]. A response arriving later is ignored.
    pub fn abort(&self) {
        if let Some((_, tx)) = self.pending.remove(&self.id) {
            let _ = tx.send(Err(ConnectionError::Aborted.into()));
        }
    }

    /// Await the server's response.
    pub async fn result(self) -> Result<Value, RemoteError> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without a response.
            Err(_) => Err(ConnectionError::Aborted.into()),
        }
    }
}

/// Connection list, primary designation, and per-request server selection.
#[derive(Debug)]
pub struct ServerPool {
    connections: RwLock<Vec<Arc<ServerConnection>>>,
    primary: RwLock<Option<usize>>,
    /// Public connected flag. Flipped synchronously on disconnect, before
    /// any socket actually closes.
    connected: AtomicBool,
    should_connect: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, ResponseSender>>,
    deferred: Mutex<Vec<DeferredSend>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            primary: RwLock::new(None),
            connected: AtomicBool::new(false),
            should_connect: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn should_connect_flag(&self) -> Arc<AtomicBool> {
        self.should_connect.clone()
    }

    /// Create a connection for an endpoint and register it. A primary
    /// endpoint displaces any previous primary designation.
    pub fn add(&self, endpoint: ServerEndpoint) -> Arc<ServerConnection> {
        let mut connections = self.connections.write();
        let index = connections.len();
        let connection = Arc::new(ServerConnection::new(
            index,
            endpoint.clone(),
            self.should_connect.clone(),
        ));
        connections.push(connection.clone());
        drop(connections);
        if endpoint.primary {
            self.promote(index);
        }
        connection
    }

    /// Designate the primary server. Exactly one primary at a time.
    pub fn promote(&self, index: usize) {
        let connections = self.connections.read();
        let mut primary = self.primary.write();
        if let Some(previous) = *primary {
            if let Some(conn) = connections.get(previous) {
                conn.set_primary(false);
            }
        }
        if let Some(conn) = connections.get(index) {
            conn.set_primary(true);
            *primary = Some(index);
        }
    }

    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.read().clone()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<ServerConnection>> {
        self.connections.read().get(index).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.url() == url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Number of connections with an open socket.
    pub fn socket_count(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|c| c.socket_connected())
            .count()
    }

    /// Whether every configured connection has an open socket.
    pub fn all_sockets_up(&self) -> bool {
        let connections = self.connections.read();
        !connections.is_empty() && connections.iter().all(|c| c.socket_connected())
    }

    /// Public connected flag.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Select the server for a routed request: the primary when connected,
    /// otherwise the connected server minimizing score + fee estimate, ties
    /// broken by registration order.
    pub fn get_server(&self) -> Option<Arc<ServerConnection>> {
        let connections = self.connections.read();
        if let Some(index) = *self.primary.read() {
            if let Some(conn) = connections.get(index) {
                if conn.is_connected() {
                    return Some(conn.clone());
                }
            }
        }
        let mut best: Option<(&Arc<ServerConnection>, u64)> = None;
        for conn in connections.iter() {
            if !conn.is_connected() {
                continue;
            }
            let cost = conn.score() + conn.fee_estimate(1.0);
            match best {
                // Strict comparison keeps the first-registered on ties.
                Some((_, lowest)) if cost >= lowest => {}
                _ => best = Some((conn, cost)),
            }
        }
        best.map(|(conn, _)| conn.clone())
    }

    /// Route a request. Validation and the trust gate fail the request
    /// immediately; an unknown pinned server fails immediately; otherwise
    /// the request is sent, or deferred behind the next connect event.
    pub fn submit(&self, request: Request, trusted: bool) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending_request = PendingRequest {
            id,
            rx,
            pending: self.pending.clone(),
        };

        if let Err(e) = request.validate().and_then(|_| request.check_trust(trusted)) {
            let _ = tx.send(Err(e));
            return pending_request;
        }
        if self.is_empty() {
            let _ = tx.send(Err(ConnectionError::NoServers.into()));
            return pending_request;
        }
        let pin = match &request.server {
            Some(url) => match self.find_by_url(url) {
                Some(conn) => Some(conn.index()),
                None => {
                    let _ = tx.send(Err(ConnectionError::UnknownServer(url.clone()).into()));
                    return pending_request;
                }
            },
            None => None,
        };

        let payload = request.envelope(id);
        self.pending.insert(id, tx);

        if !self.is_connected() {
            debug!(id = id, command = request.command(), "deferring request until connect");
            self.deferred.lock().push(DeferredSend { payload, pin });
        } else {
            self.route_send(payload, pin);
        }
        pending_request
    }

    fn route_send(&self, payload: Value, pin: Option<usize>) {
        let target = match pin {
            Some(index) => self.connection(index),
            None => self.get_server(),
        };
        match target {
            Some(conn) => {
                if conn.send(&payload) {
                    conn.reset_score();
                } else {
                    conn.bump_score();
                    debug!(url = %conn.url(), "send failed, deferring request");
                    self.deferred.lock().push(DeferredSend { payload, pin });
                }
            }
            None => {
                // Connected flag raced a socket drop; wait for the next
                // connect event.
                self.deferred.lock().push(DeferredSend { payload, pin });
            }
        }
    }

    /// Flush requests deferred while offline. Called on connect.
    pub fn flush_deferred(&self) {
        let queued = std::mem::take(&mut *self.deferred.lock());
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing deferred requests");
        }
        for send in queued {
            self.route_send(send.payload, send.pin);
        }
    }

    /// Resolve a `response` message against the pending map. Returns false
    /// for responses nothing is waiting on.
    pub fn resolve(&self, message: &Value) -> bool {
        let id = match message.get("id").and_then(Value::as_u64) {
            Some(id) => id,
            None => return false,
        };
        let sender = match self.pending.remove(&id) {
            Some((_, tx)) => tx,
            None => {
                warn!(id = id, "response for unknown request id");
                return false;
            }
        };
        let result = if message.get("status").and_then(Value::as_str) == Some("success") {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(RemoteError::from_response(message.clone()))
        };
        let _ = sender.send(result);
        true
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn endpoint(url: &str, primary: bool) -> ServerEndpoint {
        ServerEndpoint {
            url: url.into(),
            primary,
        }
    }

    fn pool_with(urls: &[&str]) -> ServerPool {
        let pool = ServerPool::new();
        for url in urls {
            pool.add(endpoint(url, false));
        }
        pool
    }

    /// Give a connection a fake fee estimate by abusing load scaling:
    /// estimate = fee_base with default load.
    fn set_fee(conn: &ServerConnection, fee: u64) {
        conn.update_fee(&json!({ "fee_base": fee, "load_base": 256, "load_factor": 256 }));
    }

    #[test]
    fn primary_wins_regardless_of_score() {
        let pool = pool_with(&["ws://a:1", "ws://b:1", "ws://c:1"]);
        let conns = pool.connections();
        for conn in &conns {
            conn.set_connected(true);
        }
        // (score, fee) = (5, 2), (3, 1), primary (9, 9)
        for _ in 0..5 {
            conns[0].bump_score();
        }
        set_fee(&conns[0], 2);
        for _ in 0..3 {
            conns[1].bump_score();
        }
        set_fee(&conns[1], 1);
        for _ in 0..9 {
            conns[2].bump_score();
        }
        set_fee(&conns[2], 9);
        pool.promote(2);

        assert_eq!(pool.get_server().unwrap().index(), 2);
    }

    #[test]
    fn disconnected_primary_falls_back_to_cheapest() {
        let pool = pool_with(&["ws://a:1", "ws://b:1"]);
        let conns = pool.connections();
        pool.promote(0);
        conns[1].set_connected(true);
        set_fee(&conns[1], 4);
        assert_eq!(pool.get_server().unwrap().index(), 1);
    }

    #[test]
    fn ties_resolve_to_first_registered() {
        let pool = pool_with(&["ws://a:1", "ws://b:1", "ws://c:1"]);
        for conn in pool.connections() {
            conn.set_connected(true);
            set_fee(&conn, 10);
        }
        assert_eq!(pool.get_server().unwrap().index(), 0);
    }

    #[test]
    fn no_connected_server_yields_none() {
        let pool = pool_with(&["ws://a:1"]);
        assert!(pool.get_server().is_none());
    }

    #[tokio::test]
    async fn submit_without_servers_fails_immediately() {
        let pool = ServerPool::new();
        let pending = pool.submit(Request::by_name("ping").unwrap(), false);
        match pending.result().await {
            Err(RemoteError::Connection(ConnectionError::NoServers)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pinned_unknown_server_fails_immediately() {
        let pool = pool_with(&["ws://a:1"]);
        let request = Request::by_name("ping").unwrap().server("ws://nowhere:1");
        match pool.submit(request, false).result().await {
            Err(RemoteError::Connection(ConnectionError::UnknownServer(url))) => {
                assert_eq!(url, "ws://nowhere:1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_requests_defer_until_flush() {
        let pool = pool_with(&["ws://a:1"]);
        let conn = pool.connection(0).unwrap();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        conn.install_outbound(out_tx);

        let pending = pool.submit(Request::by_name("server_info").unwrap(), false);
        assert!(out_rx.try_recv().is_err(), "must not send while offline");

        conn.set_connected(true);
        pool.set_connected(true);
        pool.flush_deferred();

        let sent: Value = serde_json::from_str(&out_rx.try_recv().unwrap()).unwrap();
        assert_eq!(sent["command"], json!("server_info"));
        assert_eq!(sent["id"].as_u64().unwrap(), pending.id());
    }

    #[tokio::test]
    async fn resolve_routes_success_and_error() {
        let pool = pool_with(&["ws://a:1"]);
        let conn = pool.connection(0).unwrap();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        conn.install_outbound(out_tx);
        conn.set_connected(true);
        pool.set_connected(true);

        let ok = pool.submit(Request::by_name("ping").unwrap(), false);
        assert!(pool.resolve(&json!({
            "id": ok.id(), "type": "response", "status": "success", "result": {"pong": true}
        })));
        assert_eq!(ok.result().await.unwrap()["pong"], json!(true));

        let bad = pool.submit(Request::by_name("ping").unwrap(), false);
        assert!(pool.resolve(&json!({
            "id": bad.id(), "type": "response", "status": "error",
            "error": "slowDown", "error_message": "too busy"
        })));
        match bad.result().await {
            Err(RemoteError::NetworkResult { error, .. }) => assert_eq!(error, "slowDown"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn abort_resolves_with_connection_error() {
        let pool = pool_with(&["ws://a:1"]);
        let pending = pool.submit(Request::by_name("ping").unwrap(), false);
        pending.abort();
        match pending.result().await {
            Err(RemoteError::Connection(ConnectionError::Aborted)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn untrusted_secret_command_fails_locally() {
        let pool = pool_with(&["ws://a:1"]);
        let request = Request::by_name("wallet_accounts").unwrap().secret("shh");
        assert!(pool.submit(request, false).result().await.is_err());
    }
}
