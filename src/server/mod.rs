//! Server connections and request routing

pub mod connection;
pub mod pool;

pub use connection::{ServerConnection, ServerStatus};
pub use pool::{PendingRequest, ServerPool};

use serde_json::Value;

/// Events flowing from server io tasks into the remote's dispatch task.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// Socket established and ready to carry traffic.
    Connected { server: usize },
    /// Socket closed or failed.
    Disconnected { server: usize },
    /// A parsed inbound message.
    Message { server: usize, payload: Value },
    /// Inbound bytes that did not parse as a JSON object.
    Malformed { server: usize, detail: String },
}
