//! Per-account sequence cache
//!
//! Sequence numbers are tracked locally so transactions can be filled
//! without a round trip. ADVANCE and REWIND are atomic read-adjust
//! operations returning the pre-adjustment value. A network refill is
//! at-most-one-in-flight per account: late callers attach to the running
//! refill instead of duplicating it.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::address::Address;
use crate::errors::RemoteError;

type RefillResult = Result<u32, RemoteError>;

#[derive(Debug, Default)]
struct SeqEntry {
    seq: Option<u32>,
    inflight: Option<broadcast::Sender<RefillResult>>,
}

/// Outcome of [`AccountSequenceCache::begin_refill`].
pub enum RefillTicket {
    /// This caller runs the network request and publishes the result.
    Leader(broadcast::Sender<RefillResult>),
    /// A refill is already running; await its broadcast.
    Follower(broadcast::Receiver<RefillResult>),
}

/// Cached sequence numbers with network-backed refill.
#[derive(Debug, Default)]
pub struct AccountSequenceCache {
    entries: DashMap<Address, SeqEntry>,
}

impl AccountSequenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &Address) -> Option<u32> {
        self.entries.get(account).and_then(|e| e.seq)
    }

    pub fn set(&self, account: &Address, seq: u32) {
        self.entries.entry(account.clone()).or_default().seq = Some(seq);
    }

    pub fn clear(&self, account: &Address) {
        if let Some(mut entry) = self.entries.get_mut(account) {
            entry.seq = None;
        }
    }

    /// Read the cached sequence and advance it by one. Returns the
    /// pre-advance value, or `None` when the sequence is unknown.
    pub fn advance(&self, account: &Address) -> Option<u32> {
        self.adjust(account, 1)
    }

    /// Read the cached sequence and step it back by one. Returns the
    /// pre-rewind value, or `None` when the sequence is unknown.
    pub fn rewind(&self, account: &Address) -> Option<u32> {
        self.adjust(account, -1)
    }

    fn adjust(&self, account: &Address, delta: i64) -> Option<u32> {
        let mut entry = self.entries.get_mut(account)?;
        let current = entry.seq?;
        entry.seq = Some((current as i64 + delta).max(0) as u32);
        Some(current)
    }

    /// Join or start a refill for an account. The leader performs the
    /// network request, then calls [`Self::finish_refill`] and publishes on
    /// its sender; followers await the broadcast.
    pub fn begin_refill(&self, account: &Address) -> RefillTicket {
        let mut entry = self.entries.entry(account.clone()).or_default();
        if let Some(tx) = &entry.inflight {
            debug!(account = %account, "joining in-flight sequence refill");
            return RefillTicket::Follower(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        entry.inflight = Some(tx.clone());
        RefillTicket::Leader(tx)
    }

    /// Record a refill outcome: success updates the cache, failure leaves
    /// it untouched; either way the in-flight marker is cleared.
    pub fn finish_refill(&self, account: &Address, result: &RefillResult) {
        let mut entry = self.entries.entry(account.clone()).or_default();
        entry.inflight = None;
        if let Ok(seq) = result {
            entry.seq = Some(*seq);
        }
    }

    /// Whether a refill is currently running for the account.
    pub fn refill_in_flight(&self, account: &Address) -> bool {
        self.entries
            .get(account)
            .map(|e| e.inflight.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::encode_check;
    use crate::errors::ConnectionError;

    fn addr(fill: u8) -> Address {
        Address::parse(&encode_check(0, &[fill; 20])).unwrap()
    }

    #[test]
    fn advance_then_rewind_restores_original() {
        let cache = AccountSequenceCache::new();
        let account = addr(1);
        cache.set(&account, 42);

        assert_eq!(cache.advance(&account), Some(42));
        assert_eq!(cache.get(&account), Some(43));
        assert_eq!(cache.rewind(&account), Some(43));
        assert_eq!(cache.get(&account), Some(42));
    }

    #[test]
    fn unknown_account_signals_none_and_stays_absent() {
        let cache = AccountSequenceCache::new();
        let account = addr(2);
        assert_eq!(cache.advance(&account), None);
        assert_eq!(cache.rewind(&account), None);
        assert_eq!(cache.get(&account), None);
    }

    #[tokio::test]
    async fn concurrent_refills_share_one_flight() {
        let cache = AccountSequenceCache::new();
        let account = addr(3);

        let leader = match cache.begin_refill(&account) {
            RefillTicket::Leader(tx) => tx,
            RefillTicket::Follower(_) => panic!("first caller must lead"),
        };
        let mut follower = match cache.begin_refill(&account) {
            RefillTicket::Follower(rx) => rx,
            RefillTicket::Leader(_) => panic!("second caller must follow"),
        };
        assert!(cache.refill_in_flight(&account));

        let result: RefillResult = Ok(7);
        cache.finish_refill(&account, &result);
        leader.send(result).unwrap();

        assert_eq!(follower.recv().await.unwrap().unwrap(), 7);
        assert_eq!(cache.get(&account), Some(7));
        assert!(!cache.refill_in_flight(&account));
    }

    #[test]
    fn failed_refill_clears_marker_without_touching_cache() {
        let cache = AccountSequenceCache::new();
        let account = addr(4);
        cache.set(&account, 9);

        match cache.begin_refill(&account) {
            RefillTicket::Leader(_tx) => {}
            RefillTicket::Follower(_) => panic!("must lead"),
        }
        let result: RefillResult = Err(ConnectionError::NotConnected.into());
        cache.finish_refill(&account, &result);

        assert_eq!(cache.get(&account), Some(9));
        assert!(!cache.refill_in_flight(&account));
    }

    #[test]
    fn next_refill_after_finish_leads_again() {
        let cache = AccountSequenceCache::new();
        let account = addr(5);
        match cache.begin_refill(&account) {
            RefillTicket::Leader(_tx) => {}
            _ => panic!("must lead"),
        }
        cache.finish_refill(&account, &Ok(1));
        match cache.begin_refill(&account) {
            RefillTicket::Leader(_tx) => {}
            _ => panic!("must lead again after finish"),
        }
    }
}
