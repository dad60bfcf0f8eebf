//! The remote runtime
//!
//! `Remote` owns the server pool, ledger tracker, event dispatcher, sequence
//! cache and path-find manager, and runs the single dispatch task that
//! consumes every inbound server event. All cross-component communication is
//! message passing; collaborators register by validated key and are only
//! ever pushed notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::config::RemoteConfig;
use crate::dispatch::{Collaborator, EventDispatcher};
use crate::errors::{ConnectionError, RemoteError};
use crate::events::{ConnectionState, EventBus, RemoteEvent};
use crate::ledger::LedgerTracker;
use crate::pathfind::{PathFindManager, PathFindRequest, PathFindSession};
use crate::request::Request;
use crate::sequence::{AccountSequenceCache, RefillTicket};
use crate::server::{PendingRequest, ServerEvent, ServerPool};
use crate::tx::fees;

pub(crate) struct RemoteInner {
    config: RemoteConfig,
    bus: EventBus,
    pool: ServerPool,
    tracker: LedgerTracker,
    dispatcher: EventDispatcher,
    sequences: AccountSequenceCache,
    pathfinds: PathFindManager,
    secrets: DashMap<Address, String>,
    account_roots: DashMap<Address, Value>,
    online: AtomicBool,
    ready_emitted: AtomicBool,
    stand_alone: AtomicBool,
    testnet: AtomicBool,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    io_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side runtime handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<RemoteInner>,
}

impl Remote {
    /// Build a remote from validated configuration. Configuration problems
    /// fail here, synchronously; nothing has connected yet.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let config = config.validated()?;
        let pool = ServerPool::new();
        for endpoint in &config.servers {
            pool.add(endpoint.clone());
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(config.max_listeners);
        Ok(Remote {
            inner: Arc::new(RemoteInner {
                config,
                bus,
                pool,
                tracker: LedgerTracker::new(),
                dispatcher: EventDispatcher::new(),
                sequences: AccountSequenceCache::new(),
                pathfinds: PathFindManager::new(),
                secrets: DashMap::new(),
                account_roots: DashMap::new(),
                online: AtomicBool::new(false),
                ready_emitted: AtomicBool::new(false),
                stand_alone: AtomicBool::new(false),
                testnet: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                io_handles: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    /// Subscribe to remote events.
    pub fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.inner.bus.subscribe()
    }

    /// Open sockets to every configured server and start the dispatch task.
    pub fn connect(&self) {
        let flag = self.inner.pool.should_connect_flag();
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut rx) = self.inner.events_rx.lock().take() {
            let remote = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    remote.handle_event(event);
                }
            });
        }
        let mut handles = self.inner.io_handles.lock();
        for connection in self.inner.pool.connections() {
            handles.push(connection.spawn_io(self.inner.events_tx.clone()));
        }
    }

    /// Stop connecting and tear sockets down. The public connected flag
    /// flips before any socket actually closes, so no reader observes a
    /// stale "connected" after this returns. Idempotent.
    pub fn disconnect(&self) {
        self.inner
            .pool
            .should_connect_flag()
            .store(false, Ordering::Release);
        let was_connected = self.inner.pool.is_connected();
        self.inner.pool.set_connected(false);
        for handle in self.inner.io_handles.lock().drain(..) {
            handle.abort();
        }
        for connection in self.inner.pool.connections() {
            connection.set_connected(false);
        }
        self.inner.ready_emitted.store(false, Ordering::Release);
        if was_connected {
            self.set_state(ConnectionState::Offline);
        }
    }

    /// Register an additional server. A primary endpoint displaces the
    /// current primary designation. If the remote is already connecting,
    /// the new connection starts immediately.
    pub fn add_server(&self, endpoint: crate::config::ServerEndpoint) -> Result<(), RemoteError> {
        crate::config::validate_ws_url(&endpoint.url)?;
        let connection = self.inner.pool.add(endpoint);
        if self
            .inner
            .pool
            .should_connect_flag()
            .load(Ordering::Acquire)
        {
            self.inner
                .io_handles
                .lock()
                .push(connection.spawn_io(self.inner.events_tx.clone()));
        }
        Ok(())
    }

    /// Public connected flag.
    pub fn is_connected(&self) -> bool {
        self.inner.pool.is_connected()
    }

    pub fn is_stand_alone(&self) -> bool {
        self.inner.stand_alone.load(Ordering::Acquire)
    }

    pub fn is_testnet(&self) -> bool {
        self.inner.testnet.load(Ordering::Acquire)
    }

    /// Tracked current ledger index: one past the last observed close.
    pub fn ledger_current_index(&self) -> Option<u64> {
        self.inner.tracker.current_index()
    }

    pub fn ledger_hash(&self) -> Option<String> {
        self.inner.tracker.ledger_hash()
    }

    pub fn ledger_time(&self) -> Option<u64> {
        self.inner.tracker.ledger_time()
    }

    /// Median of the connected servers' cushioned per-unit fee estimates.
    pub fn fee_estimate_median(&self) -> Option<u64> {
        let fees: Vec<u64> = self
            .inner
            .pool
            .connections()
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.fee_estimate(self.inner.config.fee_cushion))
            .collect();
        fees::median_fee(fees)
    }

    /// Store a secret so transactions from `account` can be auto-signed.
    pub fn set_secret(&self, account: Address, secret: String) {
        self.inner.secrets.insert(account, secret);
    }

    pub(crate) fn secret_for(&self, account: &Address) -> Option<String> {
        self.inner.secrets.get(account).map(|s| s.value().clone())
    }

    pub(crate) fn sequences(&self) -> &AccountSequenceCache {
        &self.inner.sequences
    }

    /// Register an account collaborator for transaction fan-out.
    pub fn subscribe_account(&self, account: Address, collaborator: Arc<dyn Collaborator>) {
        self.inner.dispatcher.subscribe_account(account, collaborator);
    }

    pub fn unsubscribe_account(&self, account: &Address) {
        self.inner.dispatcher.unsubscribe_account(account);
    }

    /// Register an order-book collaborator under its book key.
    pub fn subscribe_book(&self, key: String, collaborator: Arc<dyn Collaborator>) {
        self.inner.dispatcher.subscribe_book(key, collaborator);
    }

    pub fn unsubscribe_book(&self, key: &str) {
        self.inner.dispatcher.unsubscribe_book(key);
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Resolve a command by name through the registry.
    pub fn request_by_name(&self, name: &str) -> Option<Request> {
        Request::by_name(name)
    }

    /// Route a request through the pool.
    pub fn submit_request(&self, request: Request) -> PendingRequest {
        self.inner.pool.submit(request, self.inner.config.trusted)
    }

    pub fn request_ping(&self) -> Request {
        Request::by_name("ping").expect("registered command")
    }

    pub fn request_server_info(&self) -> Request {
        Request::by_name("server_info").expect("registered command")
    }

    pub fn request_ledger(&self) -> Request {
        Request::by_name("ledger").expect("registered command")
    }

    pub fn request_ledger_closed(&self) -> Request {
        Request::by_name("ledger_closed").expect("registered command")
    }

    pub fn request_ledger_header(&self) -> Request {
        Request::by_name("ledger_header").expect("registered command")
    }

    pub fn request_ledger_current(&self) -> Request {
        Request::by_name("ledger_current").expect("registered command")
    }

    pub fn request_ledger_data(&self) -> Request {
        Request::by_name("ledger_data").expect("registered command")
    }

    pub fn request_ledger_entry(&self, entry_type: &str) -> Request {
        Request::by_name("ledger_entry")
            .expect("registered command")
            .field("type", json!(entry_type))
    }

    pub fn request_subscribe(&self, streams: &[&str]) -> Request {
        Request::by_name("subscribe")
            .expect("registered command")
            .streams(streams)
    }

    pub fn request_unsubscribe(&self, streams: &[&str]) -> Request {
        Request::by_name("unsubscribe")
            .expect("registered command")
            .streams(streams)
    }

    pub fn request_transaction_entry(&self, hash: &str) -> Request {
        Request::by_name("transaction_entry")
            .expect("registered command")
            .tx_hash(hash)
    }

    pub fn request_tx(&self, hash: &str) -> Request {
        Request::by_name("tx")
            .expect("registered command")
            .field("transaction", json!(hash))
    }

    pub fn request_account_info(&self, account: &Address) -> Request {
        Request::by_name("account_info")
            .expect("registered command")
            .account(account)
    }

    pub fn request_account_currencies(&self, account: &Address) -> Request {
        Request::by_name("account_currencies")
            .expect("registered command")
            .account(account)
    }

    pub fn request_account_lines(&self, account: &Address) -> Request {
        Request::by_name("account_lines")
            .expect("registered command")
            .account(account)
    }

    pub fn request_account_offers(&self, account: &Address) -> Request {
        Request::by_name("account_offers")
            .expect("registered command")
            .account(account)
    }

    /// Paged account transaction history. Pass the previous response's
    /// marker to continue; a marker requires an explicit ledger selector.
    pub fn request_account_tx(&self, account: &Address) -> Request {
        Request::by_name("account_tx")
            .expect("registered command")
            .account(account)
    }

    pub fn request_book_offers(&self, taker_gets: Value, taker_pays: Value) -> Request {
        Request::by_name("book_offers")
            .expect("registered command")
            .field("taker_gets", taker_gets)
            .field("taker_pays", taker_pays)
    }

    pub fn request_wallet_accounts(&self, seed: &str) -> Request {
        Request::by_name("wallet_accounts")
            .expect("registered command")
            .field("seed", json!(seed))
    }

    pub fn request_sign(&self, secret: &str, tx_json: Value) -> Request {
        Request::by_name("sign")
            .expect("registered command")
            .secret(secret)
            .tx_json(tx_json)
    }

    pub fn request_submit(&self) -> Request {
        Request::by_name("submit").expect("registered command")
    }

    pub fn request_unl_list(&self) -> Request {
        Request::by_name("unl_list").expect("registered command")
    }

    pub fn request_unl_add(&self, node: &str, comment: Option<&str>) -> Request {
        let request = Request::by_name("unl_add")
            .expect("registered command")
            .field("node", json!(node));
        match comment {
            Some(comment) => request.field("comment", json!(comment)),
            None => request,
        }
    }

    pub fn request_unl_delete(&self, node: &str) -> Request {
        Request::by_name("unl_delete")
            .expect("registered command")
            .field("node", json!(node))
    }

    pub fn request_peers(&self) -> Request {
        Request::by_name("peers").expect("registered command")
    }

    pub fn request_connect(&self, ip: &str, port: Option<u16>) -> Request {
        let request = Request::by_name("connect")
            .expect("registered command")
            .field("ip", json!(ip));
        match port {
            Some(port) => request.field("port", json!(port)),
            None => request,
        }
    }

    /// Fetch an account's root ledger entry with a transparent local cache.
    pub async fn account_root(&self, account: &Address) -> Result<Value, RemoteError> {
        if let Some(node) = self.inner.account_roots.get(account) {
            trace!(account = %account, "account_root cache hit");
            return Ok(node.value().clone());
        }
        let request = self.request_ledger_entry("account_root").account_root(account);
        let result = self.submit_request(request).result().await?;
        let node = result.get("node").cloned().unwrap_or(Value::Null);
        if node.is_object() {
            self.inner.account_roots.insert(account.clone(), node.clone());
        }
        Ok(node)
    }

    /// Drop the cached root entry for an account.
    pub fn dirty_account_root(&self, account: &Address) {
        self.inner.account_roots.remove(account);
    }

    /// Refill the cached sequence for an account from the network. Shared:
    /// if a refill is already running the caller awaits its result instead
    /// of issuing a second request.
    pub async fn refill_sequence(&self, account: &Address) -> Result<u32, RemoteError> {
        match self.inner.sequences.begin_refill(account) {
            RefillTicket::Follower(mut rx) => match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Aborted.into()),
            },
            RefillTicket::Leader(tx) => {
                let result = self.fetch_sequence(account).await;
                self.inner.sequences.finish_refill(account, &result);
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    async fn fetch_sequence(&self, account: &Address) -> Result<u32, RemoteError> {
        let result = self
            .submit_request(self.request_account_info(account))
            .result()
            .await?;
        result
            .get("account_data")
            .and_then(|d| d.get("Sequence"))
            .and_then(Value::as_u64)
            .map(|s| s as u32)
            .ok_or_else(|| {
                RemoteError::Protocol("account_info response missing Sequence".into())
            })
    }

    // ------------------------------------------------------------------
    // Transaction stream lifecycle
    // ------------------------------------------------------------------

    /// Listen to the transaction stream. The first listener issues the
    /// stream subscribe; dropping the last one issues the unsubscribe.
    pub fn transactions(&self) -> TransactionStream {
        let count = self.inner.dispatcher.add_transaction_listener();
        if count == 1 && self.is_connected() {
            debug!("first transaction listener, subscribing to stream");
            let _ = self.submit_request(self.request_subscribe(&["transactions"]));
        }
        TransactionStream {
            remote: self.clone(),
            rx: self.inner.bus.subscribe(),
        }
    }

    // ------------------------------------------------------------------
    // Path finding
    // ------------------------------------------------------------------

    /// Start (or queue) a path-find session. Only one session is active at
    /// a time; queued sessions start automatically in FIFO order.
    pub fn create_path_find(&self, request: PathFindRequest) -> Arc<PathFindSession> {
        let (session, started) = self.inner.pathfinds.create(request);
        if started {
            self.send_path_find_create(&session);
        }
        session
    }

    /// Close the active path-find session, promoting the next queued one.
    pub fn close_path_find(&self) {
        if self.inner.pathfinds.active().is_some() {
            let close = Request::by_name("path_find")
                .expect("registered command")
                .field("subcommand", json!("close"));
            let _ = self.submit_request(close);
        }
        if let Some(next) = self.inner.pathfinds.close_active() {
            self.send_path_find_create(&next);
        }
    }

    pub fn active_path_find(&self) -> Option<Arc<PathFindSession>> {
        self.inner.pathfinds.active()
    }

    fn send_path_find_create(&self, session: &Arc<PathFindSession>) {
        let mut request = Request::by_name("path_find").expect("registered command");
        if let Value::Object(fields) = session.create_fields() {
            for (key, value) in fields {
                request = request.field(key, value);
            }
        }
        let _ = self.submit_request(request);
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Online => {
                if !self.inner.online.swap(true, Ordering::AcqRel) {
                    self.inner.bus.emit(RemoteEvent::State(ConnectionState::Online));
                    self.inner.bus.emit(RemoteEvent::Connect);
                }
            }
            ConnectionState::Offline => {
                if self.inner.online.swap(false, Ordering::AcqRel) {
                    self.inner.bus.emit(RemoteEvent::State(ConnectionState::Offline));
                    self.inner.bus.emit(RemoteEvent::Disconnect);
                }
            }
        }
    }

    fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Handle one server event. This is the single logical thread of
    /// control: the dispatch task calls it for every inbound event in
    /// arrival order.
    pub(crate) fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { server } => self.handle_connected(server),
            ServerEvent::Disconnected { server } => self.handle_disconnected(server),
            ServerEvent::Message { server, payload } => self.handle_message(server, payload),
            ServerEvent::Malformed { server, detail } => {
                warn!(server = server, detail = %detail, "malformed inbound message");
                self.inner.bus.emit(RemoteEvent::ProtocolError(detail));
            }
        }
    }

    fn handle_connected(&self, server: usize) {
        let first = !self.inner.pool.is_connected();
        if first {
            self.inner.pool.set_connected(true);
            self.set_state(ConnectionState::Online);
            for header in self.inner.tracker.take_deferred() {
                self.inner.bus.emit(RemoteEvent::LedgerClosed(header));
            }
            self.inner.pool.flush_deferred();
        }
        if self.inner.pool.all_sockets_up()
            && !self.inner.ready_emitted.swap(true, Ordering::AcqRel)
        {
            self.inner.bus.emit(RemoteEvent::Ready);
        }
        self.start_subscribe(server);
    }

    fn handle_disconnected(&self, server: usize) {
        debug!(server = server, "server disconnected");
        if self.inner.pool.socket_count() == 0 && self.inner.pool.is_connected() {
            self.inner.pool.set_connected(false);
            self.set_state(ConnectionState::Offline);
        }
    }

    /// Issue the stream subscribe handshake to a newly connected server and
    /// seed ledger/fee state from its response.
    fn start_subscribe(&self, server: usize) {
        let connection = match self.inner.pool.connection(server) {
            Some(connection) => connection,
            None => return,
        };
        let mut streams = vec!["ledger", "server"];
        if self.inner.dispatcher.transaction_listeners() > 0 {
            streams.push("transactions");
        }
        let request = self
            .request_subscribe(&streams)
            .server(connection.url().to_string());
        let pending = self.submit_request(request);
        let remote = self.clone();
        tokio::spawn(async move {
            match pending.result().await {
                Ok(result) => remote.seed_from_subscribe(server, result),
                Err(e) => warn!(server = server, error = %e, "subscribe handshake failed"),
            }
        });
    }

    fn seed_from_subscribe(&self, server: usize, result: Value) {
        if let Some(stand_alone) = result.get("stand_alone").and_then(Value::as_bool) {
            self.inner.stand_alone.store(stand_alone, Ordering::Release);
        }
        if let Some(testnet) = result.get("testnet").and_then(Value::as_bool) {
            self.inner.testnet.store(testnet, Ordering::Release);
        }
        if let Some(connection) = self.inner.pool.connection(server) {
            connection.update_fee(&result);
            if let Some(status) = result.get("server_status").and_then(Value::as_str) {
                connection.set_status(status);
            }
        }
        // The subscribe result doubles as a ledger snapshot when complete.
        self.apply_ledger(&result);
        self.inner.bus.emit(RemoteEvent::Subscribed);
    }

    fn handle_message(&self, server: usize, payload: Value) {
        let message_type = match payload.get("type").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => {
                self.inner
                    .bus
                    .emit(RemoteEvent::ProtocolError("message without type".into()));
                return;
            }
        };
        if self.inner.config.trace {
            debug!(server = server, message_type = %message_type, payload = %payload, "inbound");
        }
        match message_type.as_str() {
            "response" => {
                if !self.inner.pool.resolve(&payload) {
                    trace!(server = server, "unmatched response");
                }
            }
            "ledgerClosed" => self.apply_ledger(&payload),
            "serverStatus" => self.handle_server_status(server, &payload),
            "transaction" => {
                self.inner.dispatcher.dispatch_transaction(payload, &self.inner.bus);
            }
            "path_find" => {
                let shared = Arc::new(payload);
                self.inner.pathfinds.route(shared.clone());
                self.inner.bus.emit(RemoteEvent::PathFindAll(shared));
            }
            "validationReceived" => {
                self.inner.bus.emit(RemoteEvent::Validation(Arc::new(payload)));
            }
            other => {
                trace!(server = server, message_type = %other, "ignoring message type");
            }
        }
    }

    fn apply_ledger(&self, payload: &Value) {
        if let Some(header) = self.inner.tracker.apply(payload) {
            if self.is_online() {
                self.inner.bus.emit(RemoteEvent::LedgerClosed(header));
            } else {
                // Advance is recorded; the event waits for the next connect.
                self.inner.tracker.defer(header);
            }
        }
    }

    fn handle_server_status(&self, server: usize, payload: &Value) {
        let connection = match self.inner.pool.connection(server) {
            Some(connection) => connection,
            None => return,
        };
        if let Some(status) = payload.get("server_status").and_then(Value::as_str) {
            connection.set_status(status);
        }
        if connection.update_fee(payload) {
            let info = connection.fee_info();
            self.inner.bus.emit(RemoteEvent::Load {
                load_base: info.load_base,
                load_factor: info.load_factor,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &ServerPool {
        &self.inner.pool
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &LedgerTracker {
        &self.inner.tracker
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("connected", &self.is_connected())
            .field("servers", &self.inner.pool.len())
            .field("ledger_current_index", &self.ledger_current_index())
            .finish_non_exhaustive()
    }
}

/// RAII transaction stream listener. Holding one keeps the stream
/// subscription alive; dropping the last one unsubscribes.
pub struct TransactionStream {
    remote: Remote,
    rx: broadcast::Receiver<RemoteEvent>,
}

impl TransactionStream {
    /// Next transaction message from the stream.
    pub async fn recv(&mut self) -> Option<Arc<Value>> {
        loop {
            match self.rx.recv().await {
                Ok(RemoteEvent::TransactionAll(message)) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "transaction stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for TransactionStream {
    fn drop(&mut self) {
        let count = self.remote.inner.dispatcher.remove_transaction_listener();
        if count == 0 && self.remote.is_connected() {
            debug!("last transaction listener dropped, unsubscribing");
            let _ = self
                .remote
                .submit_request(self.remote.request_unsubscribe(&["transactions"]));
        }
    }
}
