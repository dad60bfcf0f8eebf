//! Ledger progression tracking
//!
//! Consumes `ledgerClosed` messages, validates their shape field by field,
//! and advances the locally observed index/hash/time. A malformed message is
//! dropped without touching state or firing events; one faulty server among
//! several must not corrupt tracking. Equal indices are re-applied on
//! purpose: the same close observed from a second server corroborates the
//! first and re-fires the event.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01).
const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// A validated ledger-close announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerHeader {
    /// Index of the ledger that closed.
    pub ledger_index: u64,
    pub ledger_hash: String,
    /// Close time in seconds since the ledger epoch.
    pub ledger_time: u64,
    pub fee_base: u64,
    pub fee_ref: u64,
    pub reserve_base: u64,
    pub reserve_inc: u64,
}

impl LedgerHeader {
    /// Parse and shape-validate a `ledgerClosed` payload. Returns `None` for
    /// any missing or mistyped required field.
    pub fn from_message(message: &Value) -> Option<Self> {
        Some(LedgerHeader {
            ledger_index: message.get("ledger_index")?.as_u64()?,
            ledger_hash: message.get("ledger_hash")?.as_str()?.to_string(),
            ledger_time: message.get("ledger_time")?.as_u64()?,
            fee_base: message.get("fee_base")?.as_u64()?,
            fee_ref: message.get("fee_ref")?.as_u64()?,
            reserve_base: message.get("reserve_base")?.as_u64()?,
            reserve_inc: message.get("reserve_inc")?.as_u64()?,
        })
    }

    /// Close time as UTC wall-clock time.
    pub fn close_time_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.ledger_time as i64 + LEDGER_EPOCH_OFFSET, 0)
            .single()
    }
}

#[derive(Debug, Default)]
struct TrackedState {
    current_index: Option<u64>,
    hash: Option<String>,
    time: Option<u64>,
}

/// Tracks the locally observed ledger frontier.
#[derive(Debug, Default)]
pub struct LedgerTracker {
    state: RwLock<TrackedState>,
    /// Headers accepted before the remote came online; flushed on connect.
    deferred: Mutex<Vec<LedgerHeader>>,
}

impl LedgerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `ledgerClosed` message. Returns the accepted header when
    /// tracking advanced (or was corroborated); `None` when the message was
    /// malformed or stale. The tracked current index becomes
    /// `closed_index + 1` and never regresses.
    pub fn apply(&self, message: &Value) -> Option<LedgerHeader> {
        let header = match LedgerHeader::from_message(message) {
            Some(h) => h,
            None => {
                debug!("dropping malformed ledgerClosed message");
                return None;
            }
        };

        let mut state = self.state.write();
        if let Some(current) = state.current_index {
            // `current` is one past the last closed index. A close equal to
            // the last one re-applies: a second server's view of the same
            // close corroborates it and is not deduplicated.
            if header.ledger_index + 1 < current {
                debug!(
                    ledger_index = header.ledger_index,
                    current = current,
                    "ignoring stale ledger close"
                );
                return None;
            }
        }
        state.hash = Some(header.ledger_hash.clone());
        state.time = Some(header.ledger_time);
        state.current_index = Some(header.ledger_index + 1);
        debug!(
            ledger_index = header.ledger_index,
            ledger_hash = %header.ledger_hash,
            "ledger closed"
        );
        Some(header)
    }

    /// Park a header until the remote comes online.
    pub fn defer(&self, header: LedgerHeader) {
        self.deferred.lock().push(header);
    }

    /// Drain headers deferred while offline.
    pub fn take_deferred(&self) -> Vec<LedgerHeader> {
        std::mem::take(&mut *self.deferred.lock())
    }

    /// The tracked current index: one past the last closed ledger.
    pub fn current_index(&self) -> Option<u64> {
        self.state.read().current_index
    }

    pub fn ledger_hash(&self) -> Option<String> {
        self.state.read().hash.clone()
    }

    pub fn ledger_time(&self) -> Option<u64> {
        self.state.read().time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn closed(index: u64) -> Value {
        json!({
            "type": "ledgerClosed",
            "fee_base": 10,
            "fee_ref": 10,
            "ledger_hash": format!("{:064X}", index),
            "ledger_index": index,
            "ledger_time": 464_908_910u64 + index,
            "reserve_base": 20_000_000u64,
            "reserve_inc": 5_000_000u64,
        })
    }

    #[test]
    fn advance_sets_current_to_closed_plus_one() {
        let tracker = LedgerTracker::new();
        assert!(tracker.apply(&closed(1000)).is_some());
        assert_eq!(tracker.current_index(), Some(1001));
        assert_eq!(tracker.ledger_hash().unwrap(), format!("{:064X}", 1000));
    }

    #[test]
    fn equal_index_is_reapplied() {
        let tracker = LedgerTracker::new();
        assert!(tracker.apply(&closed(1000)).is_some());
        // Corroboration from a second server re-fires.
        assert!(tracker.apply(&closed(1000)).is_some());
        assert_eq!(tracker.current_index(), Some(1001));
    }

    #[test]
    fn lower_index_is_silently_ignored() {
        let tracker = LedgerTracker::new();
        assert!(tracker.apply(&closed(1000)).is_some());
        assert!(tracker.apply(&closed(999)).is_none());
        assert_eq!(tracker.current_index(), Some(1001));
        assert_eq!(tracker.ledger_hash().unwrap(), format!("{:064X}", 1000));
    }

    #[test]
    fn malformed_message_leaves_state_unchanged() {
        let tracker = LedgerTracker::new();
        assert!(tracker.apply(&closed(1000)).is_some());

        let mut bad = closed(2000);
        bad["ledger_hash"] = json!(12345); // wrong type
        assert!(tracker.apply(&bad).is_none());

        let mut missing = closed(2000);
        missing.as_object_mut().unwrap().remove("fee_base");
        assert!(tracker.apply(&missing).is_none());

        assert_eq!(tracker.current_index(), Some(1001));
    }

    #[test]
    fn close_time_converts_from_ledger_epoch() {
        let header = LedgerHeader::from_message(&closed(5)).unwrap();
        let utc = header.close_time_utc().unwrap();
        assert_eq!(utc.timestamp(), header.ledger_time as i64 + 946_684_800);
    }

    #[test]
    fn deferred_headers_drain_once() {
        let tracker = LedgerTracker::new();
        let header = LedgerHeader::from_message(&closed(7)).unwrap();
        tracker.defer(header.clone());
        assert_eq!(tracker.take_deferred(), vec![header]);
        assert!(tracker.take_deferred().is_empty());
    }

    proptest! {
        #[test]
        fn current_index_is_one_past_max_well_formed(indices in proptest::collection::vec(0u64..5000, 1..60)) {
            let tracker = LedgerTracker::new();
            let mut observed_max = None::<u64>;
            let mut last_current = 0u64;
            for index in indices {
                tracker.apply(&closed(index));
                let current = tracker.current_index().unwrap_or(0);
                // Non-decreasing across any message sequence.
                prop_assert!(current >= last_current);
                last_current = current;
                observed_max = Some(observed_max.map_or(index, |m| m.max(index)));
            }
            prop_assert_eq!(tracker.current_index(), observed_max.map(|m| m + 1));
        }
    }
}
