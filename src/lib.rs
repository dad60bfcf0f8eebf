//! Client-side runtime for a distributed-ledger network
//!
//! Maintains websocket connections to one or more network servers, routes
//! requests with failover and health-scored selection, tracks ledger
//! progression, fans out transaction/ledger/path-find events to registered
//! collaborators, and prepares, fills, signs, and submits transactions.

pub mod address;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod hashes;
pub mod ledger;
pub mod pathfind;
pub mod remote;
pub mod request;
pub mod sequence;
pub mod server;
pub mod tx;

// Re-export commonly used types
pub use address::{Address, Seed};
pub use config::{RemoteConfig, ServerEndpoint};
pub use dispatch::Collaborator;
pub use errors::{ConnectionError, PrepError, RemoteError};
pub use events::{ConnectionState, RemoteEvent};
pub use ledger::LedgerHeader;
pub use pathfind::{PathFindRequest, PathFindSession};
pub use remote::{Remote, TransactionStream};
pub use request::{BookSide, Request};
pub use server::{PendingRequest, ServerConnection};
pub use tx::{Transaction, TxState};
