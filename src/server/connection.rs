//! A single server connection
//!
//! One websocket to one server: a read task feeding the remote's dispatch
//! channel and a write task draining an outbound queue. Reconnection follows
//! a fixed backoff ladder; fast for the first seconds of an outage, then
//! progressively patient.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::ServerEvent;
use crate::config::ServerEndpoint;

/// Server states treated as able to process transactions and notify us of
/// changes.
pub const ONLINE_STATES: [&str; 3] = ["proposing", "validating", "full"];

/// Last reported status of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Unknown,
    Reported(String),
}

impl ServerStatus {
    /// Whether the reported status counts as online. An unknown status is
    /// optimistically online; the first `serverStatus` message corrects it.
    pub fn is_online(&self) -> bool {
        match self {
            ServerStatus::Unknown => true,
            ServerStatus::Reported(s) => ONLINE_STATES.contains(&s.as_str()),
        }
    }
}

/// Fee and load parameters reported by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeInfo {
    /// Base fee in drops for a reference transaction.
    pub fee_base: u64,
    /// Reference transaction cost in fee units.
    pub fee_ref: u64,
    pub load_base: u64,
    pub load_factor: u64,
}

impl Default for FeeInfo {
    fn default() -> Self {
        Self {
            fee_base: 10,
            fee_ref: 10,
            load_base: 256,
            load_factor: 256,
        }
    }
}

/// One socket to one server.
#[derive(Debug)]
pub struct ServerConnection {
    index: usize,
    endpoint: ServerEndpoint,
    connected: AtomicBool,
    primary: AtomicBool,
    score: AtomicU64,
    fee: RwLock<FeeInfo>,
    status: RwLock<ServerStatus>,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    should_connect: Arc<AtomicBool>,
    /// Set when the server is known to be gone for good; stops reconnects.
    fatal: AtomicBool,
}

impl ServerConnection {
    pub(crate) fn new(
        index: usize,
        endpoint: ServerEndpoint,
        should_connect: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            endpoint,
            connected: AtomicBool::new(false),
            primary: AtomicBool::new(false),
            score: AtomicU64::new(0),
            fee: RwLock::new(FeeInfo::default()),
            status: RwLock::new(ServerStatus::Unknown),
            outbound: RwLock::new(None),
            should_connect,
            fatal: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &str {
        &self.endpoint.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.status.read().is_online()
    }

    /// Socket-level connectivity, ignoring the reported server status.
    pub(crate) fn socket_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
    }

    /// Routing score; lower is better. Bumped on send failures, reset on
    /// successful traffic.
    pub fn score(&self) -> u64 {
        self.score.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_score(&self) {
        self.score.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_score(&self) {
        self.score.store(0, Ordering::Relaxed);
    }

    /// Per-unit fee estimate in drops, scaled by the server's reported load
    /// and the configured cushion.
    pub fn fee_estimate(&self, cushion: f64) -> u64 {
        let fee = *self.fee.read();
        let scaled = (fee.fee_base as f64) * (fee.load_factor as f64) / (fee.load_base as f64);
        (scaled * cushion).round() as u64
    }

    pub fn fee_info(&self) -> FeeInfo {
        *self.fee.read()
    }

    /// Merge fee/load fields from a `serverStatus` or subscribe response.
    /// Returns true when the load parameters changed.
    pub(crate) fn update_fee(&self, message: &Value) -> bool {
        let mut fee = self.fee.write();
        let before = (fee.load_base, fee.load_factor);
        if let Some(v) = message.get("fee_base").and_then(Value::as_u64) {
            fee.fee_base = v;
        }
        if let Some(v) = message.get("fee_ref").and_then(Value::as_u64) {
            fee.fee_ref = v;
        }
        if let Some(v) = message.get("load_base").and_then(Value::as_u64) {
            fee.load_base = v.max(1);
        }
        if let Some(v) = message.get("load_factor").and_then(Value::as_u64) {
            fee.load_factor = v;
        }
        (fee.load_base, fee.load_factor) != before
    }

    pub fn status(&self) -> ServerStatus {
        self.status.read().clone()
    }

    pub(crate) fn set_status(&self, status: &str) {
        *self.status.write() = ServerStatus::Reported(status.to_string());
    }

    pub(crate) fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    /// Queue a payload for the write task. Returns false when no socket is
    /// up; callers defer or fail, never block.
    pub(crate) fn send(&self, payload: &Value) -> bool {
        let text = payload.to_string();
        match &*self.outbound.read() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Install an outbound sink directly. Test seam; production sockets
    /// install theirs inside the io task.
    #[cfg(test)]
    pub(crate) fn install_outbound(&self, tx: mpsc::UnboundedSender<String>) {
        *self.outbound.write() = Some(tx);
    }

    /// Drive the connection: connect, pump frames, reconnect on the backoff
    /// ladder until told to stop.
    pub(crate) fn spawn_io(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if !self.should_connect.load(Ordering::Acquire)
                    || self.fatal.load(Ordering::Acquire)
                {
                    break;
                }
                match connect_async(self.url()).await {
                    Ok((ws, _response)) => {
                        attempt = 0;
                        debug!(url = %self.url(), "websocket connected");
                        let (mut sink, mut stream) = ws.split();
                        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
                        *self.outbound.write() = Some(out_tx);
                        self.set_connected(true);
                        if events
                            .send(ServerEvent::Connected { server: self.index })
                            .is_err()
                        {
                            break;
                        }

                        let writer = tokio::spawn(async move {
                            while let Some(text) = out_rx.recv().await {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        });

                        while let Some(frame) = stream.next().await {
                            match frame {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<Value>(&text) {
                                        Ok(payload) if payload.is_object() => {
                                            if events
                                                .send(ServerEvent::Message {
                                                    server: self.index,
                                                    payload,
                                                })
                                                .is_err()
                                            {
                                                break;
                                            }
                                        }
                                        Ok(_) => {
                                            let _ = events.send(ServerEvent::Malformed {
                                                server: self.index,
                                                detail: "non-object message".to_string(),
                                            });
                                        }
                                        Err(e) => {
                                            let _ = events.send(ServerEvent::Malformed {
                                                server: self.index,
                                                detail: e.to_string(),
                                            });
                                        }
                                    }
                                }
                                Ok(Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(url = %self.url(), error = %e, "websocket read failed");
                                    break;
                                }
                            }
                        }

                        writer.abort();
                        *self.outbound.write() = None;
                        self.set_connected(false);
                        let _ = events.send(ServerEvent::Disconnected { server: self.index });
                    }
                    Err(e) => {
                        debug!(url = %self.url(), error = %e, attempt = attempt, "connect failed");
                    }
                }
                if !self.should_connect.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(reconnect_delay(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        })
    }
}

/// Reconnect backoff ladder: 50 ms for the first 40 attempts, 1 s for the
/// next 60, 10 s for the next 60, then 30 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    if attempt < 40 {
        Duration::from_millis(50)
    } else if attempt < 100 {
        Duration::from_secs(1)
    } else if attempt < 160 {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> ServerConnection {
        ServerConnection::new(
            0,
            ServerEndpoint {
                url: "ws://localhost:5006".into(),
                primary: false,
            },
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn backoff_ladder_breakpoints() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(50));
        assert_eq!(reconnect_delay(39), Duration::from_millis(50));
        assert_eq!(reconnect_delay(40), Duration::from_secs(1));
        assert_eq!(reconnect_delay(99), Duration::from_secs(1));
        assert_eq!(reconnect_delay(100), Duration::from_secs(10));
        assert_eq!(reconnect_delay(159), Duration::from_secs(10));
        assert_eq!(reconnect_delay(160), Duration::from_secs(30));
        assert_eq!(reconnect_delay(10_000), Duration::from_secs(30));
    }

    #[test]
    fn default_fee_estimate_is_base_fee() {
        let conn = connection();
        assert_eq!(conn.fee_estimate(1.0), 10);
        assert_eq!(conn.fee_estimate(1.2), 12);
    }

    #[test]
    fn load_scales_fee_estimate() {
        let conn = connection();
        let changed = conn.update_fee(&json!({"load_base": 256, "load_factor": 1024}));
        assert!(changed);
        assert_eq!(conn.fee_estimate(1.0), 40);
        // Unchanged load parameters report no change.
        assert!(!conn.update_fee(&json!({"load_base": 256, "load_factor": 1024})));
    }

    #[test]
    fn offline_status_marks_connection_unusable() {
        let conn = connection();
        conn.set_connected(true);
        assert!(conn.is_connected());
        conn.set_status("syncing");
        assert!(!conn.is_connected());
        conn.set_status("full");
        assert!(conn.is_connected());
    }

    #[test]
    fn send_without_socket_reports_failure() {
        let conn = connection();
        assert!(!conn.send(&json!({"command": "ping"})));
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.install_outbound(tx);
        assert!(conn.send(&json!({"command": "ping", "id": 1})));
        let sent = rx.try_recv().unwrap();
        assert!(sent.contains("\"command\":\"ping\""));
    }
}
