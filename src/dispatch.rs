//! Inbound event fan-out
//!
//! Routes transaction and path-find messages to registered collaborators
//! (account and order-book handles) before any generic event fires, and
//! deduplicates the transaction stream with a bounded cache. Only validated
//! transactions enter the dedup cache; an unvalidated (proposed) hash stays
//! re-deliverable until its validated form arrives.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::address::Address;
use crate::events::{EventBus, RemoteEvent};

/// Bound on the transaction dedup cache.
const DEDUP_CAPACITY: usize = 100;

/// A registered collaborator: pushed a notification for every transaction
/// affecting an entity it registered for. Collaborators never read or
/// mutate the dispatcher's maps directly.
pub trait Collaborator: Send + Sync {
    fn notify(&self, message: &Value);
}

/// Fans inbound stream messages out to collaborators and the event bus.
pub struct EventDispatcher {
    dedup: Mutex<LruCache<String, ()>>,
    accounts: DashMap<Address, Arc<dyn Collaborator>>,
    books: DashMap<String, Arc<dyn Collaborator>>,
    transaction_listeners: AtomicUsize,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("accounts", &self.accounts.len())
            .field("books", &self.books.len())
            .field(
                "transaction_listeners",
                &self.transaction_listeners.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).expect("nonzero capacity"),
            )),
            accounts: DashMap::new(),
            books: DashMap::new(),
            transaction_listeners: AtomicUsize::new(0),
        }
    }

    /// Register an account collaborator. The address was validated at
    /// construction of the `Address`, so the map never holds a malformed key.
    pub fn subscribe_account(&self, account: Address, collaborator: Arc<dyn Collaborator>) {
        self.accounts.insert(account, collaborator);
    }

    pub fn unsubscribe_account(&self, account: &Address) {
        self.accounts.remove(account);
    }

    /// Register an order-book collaborator under its book key.
    pub fn subscribe_book(&self, key: String, collaborator: Arc<dyn Collaborator>) {
        self.books.insert(key, collaborator);
    }

    pub fn unsubscribe_book(&self, key: &str) {
        self.books.remove(key);
    }

    /// Count a new transaction listener. Returns the updated count; the
    /// caller issues the stream subscribe when this returns 1.
    pub fn add_transaction_listener(&self) -> usize {
        self.transaction_listeners.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a transaction listener. Returns the updated count; the caller
    /// issues the stream unsubscribe when this returns 0.
    pub fn remove_transaction_listener(&self) -> usize {
        let previous = self.transaction_listeners.fetch_sub(1, Ordering::AcqRel);
        previous.saturating_sub(1)
    }

    pub fn transaction_listeners(&self) -> usize {
        self.transaction_listeners.load(Ordering::Acquire)
    }

    /// Dispatch an inbound transaction message. Returns false when the
    /// message was suppressed as a duplicate.
    pub fn dispatch_transaction(&self, payload: Value, bus: &EventBus) -> bool {
        let hash = payload
            .get("transaction")
            .and_then(|t| t.get("hash"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(hash) = &hash {
            if self.dedup.lock().contains(hash) {
                trace!(hash = %hash, "suppressing duplicate transaction");
                return false;
            }
        }
        let validated = payload.get("validated").and_then(Value::as_bool) == Some(true);

        let meta = payload
            .get("meta")
            .or_else(|| payload.get("metadata"))
            .filter(|m| m.is_object());

        let (accounts, books) = match meta {
            Some(meta) => (affected_accounts(meta), affected_books(meta)),
            // Proposed stream: no metadata, match on the raw fields only.
            None => (raw_accounts(&payload), Vec::new()),
        };

        // Specific collaborators are notified strictly before the generic
        // events fire.
        for account in &accounts {
            if let Ok(address) = Address::parse(account) {
                if let Some(entry) = self.accounts.get(&address) {
                    debug!(account = %account, "notifying subscribed account");
                    entry.value().notify(&payload);
                }
            }
        }
        for key in &books {
            if let Some(entry) = self.books.get(key) {
                debug!(book = %key, "notifying subscribed book");
                entry.value().notify(&payload);
            }
        }

        let shared = Arc::new(payload);
        bus.emit(RemoteEvent::Transaction(shared.clone()));
        bus.emit(RemoteEvent::TransactionAll(shared));

        if validated {
            if let Some(hash) = hash {
                self.dedup.lock().put(hash, ());
            }
        }
        true
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Account addresses affected according to transaction metadata.
fn affected_accounts(meta: &Value) -> Vec<String> {
    let mut accounts = Vec::new();
    let nodes = match meta.get("AffectedNodes").and_then(Value::as_array) {
        Some(nodes) => nodes,
        None => return accounts,
    };
    for wrapper in nodes {
        let node = match unwrap_node(wrapper) {
            Some(node) => node,
            None => continue,
        };
        for fields_key in ["FinalFields", "NewFields", "PreviousFields"] {
            let fields = match node.get(fields_key).and_then(Value::as_object) {
                Some(fields) => fields,
                None => continue,
            };
            for key in ["Account", "Owner", "Destination"] {
                if let Some(account) = fields.get(key).and_then(Value::as_str) {
                    push_unique(&mut accounts, account);
                }
            }
            for key in ["HighLimit", "LowLimit"] {
                if let Some(issuer) = fields
                    .get(key)
                    .and_then(|limit| limit.get("issuer"))
                    .and_then(Value::as_str)
                {
                    push_unique(&mut accounts, issuer);
                }
            }
        }
    }
    accounts
}

/// Book keys affected according to transaction metadata.
fn affected_books(meta: &Value) -> Vec<String> {
    let mut books = Vec::new();
    let nodes = match meta.get("AffectedNodes").and_then(Value::as_array) {
        Some(nodes) => nodes,
        None => return books,
    };
    for wrapper in nodes {
        let node = match unwrap_node(wrapper) {
            Some(node) => node,
            None => continue,
        };
        if node.get("LedgerEntryType").and_then(Value::as_str) != Some("Offer") {
            continue;
        }
        for fields_key in ["FinalFields", "NewFields", "PreviousFields"] {
            let fields = match node.get(fields_key) {
                Some(fields) => fields,
                None => continue,
            };
            if let Some(key) = book_key(fields.get("TakerGets"), fields.get("TakerPays")) {
                push_unique(&mut books, &key);
            }
        }
    }
    books
}

/// The node body inside a Created/Modified/DeletedNode wrapper.
fn unwrap_node(wrapper: &Value) -> Option<&Value> {
    for key in ["CreatedNode", "ModifiedNode", "DeletedNode"] {
        if let Some(node) = wrapper.get(key) {
            return Some(node);
        }
    }
    None
}

/// Canonical key for an order book: `gets:pays`, each side `CUR` for the
/// native asset or `CUR/issuer` for an issued one.
pub fn book_key(taker_gets: Option<&Value>, taker_pays: Option<&Value>) -> Option<String> {
    Some(format!(
        "{}:{}",
        side_key(taker_gets?)?,
        side_key(taker_pays?)?
    ))
}

fn side_key(amount: &Value) -> Option<String> {
    match amount {
        // Native amounts travel as plain drop strings.
        Value::String(_) => Some("XRP".to_string()),
        Value::Object(fields) => {
            let currency = fields.get("currency")?.as_str()?;
            match fields.get("issuer").and_then(Value::as_str) {
                Some(issuer) => Some(format!("{currency}/{issuer}")),
                None => Some(currency.to_string()),
            }
        }
        _ => None,
    }
}

fn raw_accounts(payload: &Value) -> Vec<String> {
    let mut accounts = Vec::new();
    if let Some(tx) = payload.get("transaction") {
        for key in ["Account", "Destination"] {
            if let Some(account) = tx.get(key).and_then(Value::as_str) {
                push_unique(&mut accounts, account);
            }
        }
    }
    accounts
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}
