//! Transaction preparation, signing and submission
//!
//! A [`Transaction`] walks UNSUBMITTED → SUBMITTED → PENDING →
//! VALIDATED | FAILED; both terminal states run `finalize` exactly once.
//! `complete` fills whatever the caller left blank — signing key, fee,
//! sequence, expiry — failing fast on the first unmet precondition, and a
//! filled value never overwrites an explicit one. Signing is idempotent:
//! unchanged content reuses the previous signature bytes verbatim.

pub mod fees;
pub mod flags;

use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::debug;
use zeroize::Zeroize;

use crate::address::{Address, Seed};
use crate::errors::{PrepError, RemoteError};
use crate::hashes;
use crate::remote::Remote;
use crate::request::Request;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unsubmitted,
    Submitted,
    Pending,
    Validated,
    Failed,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Validated | TxState::Failed)
    }
}

#[derive(Debug)]
struct SigBaseline {
    hash: [u8; 32],
    signature: Vec<u8>,
}

/// A transaction under preparation or in flight.
pub struct Transaction {
    tx_json: Map<String, Value>,
    secret: Option<String>,
    signing_key: Option<SigningKey>,
    state: TxState,
    state_tx: watch::Sender<TxState>,
    attempts: u32,
    submissions: u32,
    /// Hex transaction IDs of every signed form ever submitted.
    submitted_ids: Vec<String>,
    max_fee: Option<u64>,
    last_ledger_offset: Option<u32>,
    testnet: bool,
    finalized: bool,
    sig_baseline: Option<SigBaseline>,
    /// Whether the sequence was auto-filled from the local cache; on a
    /// failed submission the cache is rewound.
    sequence_filled: bool,
    result: Option<Value>,
}

impl Transaction {
    pub fn new(tx_type: &str) -> Self {
        let mut tx_json = Map::new();
        tx_json.insert("TransactionType".into(), json!(tx_type));
        tx_json.insert("Flags".into(), json!(0));
        let (state_tx, _) = watch::channel(TxState::Unsubmitted);
        Self {
            tx_json,
            secret: None,
            signing_key: None,
            state: TxState::Unsubmitted,
            state_tx,
            attempts: 0,
            submissions: 0,
            submitted_ids: Vec::new(),
            max_fee: None,
            last_ledger_offset: None,
            testnet: false,
            finalized: false,
            sig_baseline: None,
            sequence_filled: false,
            result: None,
        }
    }

    pub fn payment(account: &Address, destination: &Address, amount: Value) -> Self {
        Self::new("Payment")
            .with_field("Account", json!(account.as_str()))
            .with_field("Destination", json!(destination.as_str()))
            .with_field("Amount", amount)
    }

    pub fn account_set(account: &Address) -> Self {
        Self::new("AccountSet").with_field("Account", json!(account.as_str()))
    }

    pub fn trust_set(account: &Address, limit: Value) -> Self {
        Self::new("TrustSet")
            .with_field("Account", json!(account.as_str()))
            .with_field("LimitAmount", limit)
    }

    pub fn offer_create(account: &Address, taker_pays: Value, taker_gets: Value) -> Self {
        Self::new("OfferCreate")
            .with_field("Account", json!(account.as_str()))
            .with_field("TakerPays", taker_pays)
            .with_field("TakerGets", taker_gets)
    }

    pub fn offer_cancel(account: &Address, offer_sequence: u32) -> Self {
        Self::new("OfferCancel")
            .with_field("Account", json!(account.as_str()))
            .with_field("OfferSequence", json!(offer_sequence))
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tx_json.insert(key.into(), value);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_fee(self, fee: u64) -> Self {
        self.with_field("Fee", json!(fee.to_string()))
    }

    pub fn with_sequence(self, sequence: u32) -> Self {
        self.with_field("Sequence", json!(sequence))
    }

    /// Per-transaction fee ceiling overriding the remote's `max_fee`.
    pub fn with_max_fee(mut self, max_fee: u64) -> Self {
        self.max_fee = Some(max_fee);
        self
    }

    pub fn with_last_ledger_offset(mut self, offset: u32) -> Self {
        self.last_ledger_offset = Some(offset);
        self
    }

    /// Set named flags for this transaction's type.
    pub fn with_flags(mut self, names: &[&str]) -> Result<Self, RemoteError> {
        let tx_type = self
            .tx_json
            .get("TransactionType")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut value = self.flags_value();
        for name in names {
            let bit = flags::flag_value(&tx_type, name).ok_or(PrepError::InvalidFlag)?;
            value |= bit;
        }
        self.tx_json.insert("Flags".into(), json!(value));
        Ok(self)
    }

    pub fn tx_json(&self) -> &Map<String, Value> {
        &self.tx_json
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Watch state transitions; terminal states are delivered exactly once.
    pub fn watch_state(&self) -> watch::Receiver<TxState> {
        self.state_tx.subscribe()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    pub fn submitted_ids(&self) -> &[String] {
        &self.submitted_ids
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Current fee in drops, however it was set.
    pub fn fee(&self) -> Option<u64> {
        match self.tx_json.get("Fee") {
            Some(Value::String(s)) => s.parse().ok(),
            Some(Value::Number(n)) => n.as_u64(),
            _ => None,
        }
    }

    fn flags_value(&self) -> u32 {
        self.tx_json
            .get("Flags")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    fn account_address(&self) -> Option<Address> {
        self.tx_json
            .get("Account")
            .and_then(Value::as_str)
            .and_then(|s| Address::parse(s).ok())
    }

    /// Whether the transaction carries multi-signature signers.
    pub fn is_multi_signed(&self) -> bool {
        self.tx_json
            .get("Signers")
            .and_then(Value::as_array)
            .map(|signers| !signers.is_empty())
            .unwrap_or(false)
    }

    /// Fill everything the caller left blank, failing fast on the first
    /// unmet precondition. Never overwrites an explicit value.
    pub async fn complete(&mut self, remote: &Remote) -> Result<(), RemoteError> {
        let config = remote.config();

        // 1. Resolve a secret: explicit, or registered for the account.
        if self.secret.is_none() {
            let registered = self
                .account_address()
                .and_then(|account| remote.secret_for(&account));
            match registered {
                Some(secret) => self.secret = Some(secret),
                None => return Err(PrepError::SecretUnknown.into()),
            }
        }

        // 2. A secret must never reach an untrusted remote.
        if !config.local_signing && !config.trusted {
            return Err(PrepError::ServerUntrusted.into());
        }

        // 3. Derive the signing key; fill SigningPubKey when absent.
        let seed = Seed::parse(self.secret.as_deref().expect("secret resolved"))
            .map_err(|_| PrepError::SecretInvalid)?;
        if !self.tx_json.contains_key("SigningPubKey") {
            self.tx_json
                .insert("SigningPubKey".into(), json!(seed.public_key_hex()));
        }
        self.signing_key = Some(seed.signing_key());

        // 4. Fill the fee from the connected servers' median estimate.
        if config.local_fee && !self.tx_json.contains_key("Fee") {
            let fee = remote
                .fee_estimate_median()
                .ok_or(PrepError::Unconnected)?;
            self.tx_json.insert("Fee".into(), json!(fee.to_string()));
        }

        // 5. Hard ceiling, independent of where the fee came from.
        let fee = self.fee().unwrap_or(0);
        let ceiling = self.max_fee.unwrap_or(config.max_fee);
        if fee > ceiling {
            return Err(PrepError::MaxFeeExceeded.into());
        }

        // 6. Canonical-signature bit.
        if config.local_signing && config.canonical_signing {
            let value = self.flags_value() | flags::TF_FULLY_CANONICAL_SIG;
            self.tx_json.insert("Flags".into(), json!(value));
        }

        // Sequence from the local cache, refilled over the network when
        // unknown.
        if config.local_sequence && !self.tx_json.contains_key("Sequence") {
            let account = self
                .account_address()
                .ok_or_else(|| RemoteError::Protocol("transaction missing Account".into()))?;
            let sequence = match remote.sequences().advance(&account) {
                Some(sequence) => sequence,
                None => {
                    remote.refill_sequence(&account).await?;
                    remote.sequences().advance(&account).ok_or_else(|| {
                        RemoteError::Protocol("sequence refill yielded no value".into())
                    })?
                }
            };
            self.tx_json.insert("Sequence".into(), json!(sequence));
            self.sequence_filled = true;
        }

        // Expiry: the tracked current index already points one past the
        // last close; the offset absorbs close-time latency.
        if !self.tx_json.contains_key("LastLedgerSequence") {
            if let Some(current) = remote.ledger_current_index() {
                let offset = self
                    .last_ledger_offset
                    .unwrap_or(config.last_ledger_offset) as u64;
                self.tx_json
                    .insert("LastLedgerSequence".into(), json!(current + offset));
            }
        }

        self.testnet = remote.is_testnet();
        Ok(())
    }

    /// Signing hash over the canonical serialization, excluding any
    /// existing signature.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut body = self.tx_json.clone();
        body.remove("TxnSignature");
        hashes::signing_hash(&Value::Object(body), self.testnet)
    }

    /// Identifying hash of the fully signed transaction.
    pub fn transaction_id(&self) -> [u8; 32] {
        hashes::transaction_id(&Value::Object(self.tx_json.clone()))
    }

    /// Sign the transaction. Multi-signed transactions are never
    /// additionally single-signed; unchanged content reuses the cached
    /// signature bytes without re-invoking the signature algorithm.
    pub fn sign(&mut self) -> Result<&mut Self, RemoteError> {
        if self.is_multi_signed() {
            return Ok(self);
        }
        let hash = self.signing_hash();
        if let Some(baseline) = &self.sig_baseline {
            if baseline.hash == hash {
                let signature = hex::encode_upper(&baseline.signature);
                self.tx_json.insert("TxnSignature".into(), json!(signature));
                return Ok(self);
            }
        }
        let key = match &self.signing_key {
            Some(key) => key.clone(),
            None => {
                let secret = self.secret.as_ref().ok_or(PrepError::SecretUnknown)?;
                let seed = Seed::parse(secret).map_err(|_| PrepError::SecretInvalid)?;
                seed.signing_key()
            }
        };
        let signature = key.sign(&hash).to_bytes().to_vec();
        self.tx_json
            .insert("TxnSignature".into(), json!(hex::encode_upper(&signature)));
        self.sig_baseline = Some(SigBaseline { hash, signature });
        Ok(self)
    }

    /// Prepare, sign, and submit through the remote. Success moves the
    /// transaction to PENDING (awaiting validation); a failure is terminal
    /// here, resubmission policy belongs to the caller.
    pub async fn submit(&mut self, remote: &Remote) -> Result<Value, RemoteError> {
        if self.finalized {
            return Err(PrepError::Abort.into());
        }
        if let Err(e) = self.complete(remote).await {
            self.fail(remote, None);
            return Err(e);
        }
        self.sign()?;

        let id = hex::encode_upper(self.transaction_id());
        self.attempts += 1;
        self.submissions += 1;
        if !self.submitted_ids.contains(&id) {
            self.submitted_ids.push(id.clone());
        }
        self.set_state(TxState::Submitted);
        debug!(tx_id = %id, attempt = self.attempts, "submitting transaction");

        let request = Request::by_name("submit")
            .expect("registered command")
            .tx_json(Value::Object(self.tx_json.clone()));
        match remote.submit_request(request).result().await {
            Ok(result) => {
                self.result = Some(result.clone());
                self.set_state(TxState::Pending);
                Ok(result)
            }
            Err(e) => {
                self.fail(remote, None);
                Err(e)
            }
        }
    }

    /// Record network validation. Terminal; finalizes once.
    pub fn mark_validated(&mut self, result: Value) {
        if self.state.is_terminal() {
            return;
        }
        self.result = Some(result);
        self.set_state(TxState::Validated);
        self.finalize();
    }

    /// Record terminal failure. Finalizes once.
    pub fn mark_failed(&mut self, result: Option<Value>) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(result) = result {
            self.result = Some(result);
        }
        self.set_state(TxState::Failed);
        self.finalize();
    }

    /// Abort preparation or submission.
    pub fn abort(&mut self) {
        self.mark_failed(None);
    }

    fn fail(&mut self, remote: &Remote, result: Option<Value>) {
        // Undo an optimistic local sequence advance.
        if self.sequence_filled {
            if let Some(account) = self.account_address() {
                remote.sequences().rewind(&account);
            }
            self.sequence_filled = false;
        }
        self.mark_failed(result);
    }

    fn set_state(&mut self, state: TxState) {
        if self.state != state {
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    /// Terminal cleanup, gated by the finalized flag: runs exactly once.
    fn finalize(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        if let Some(mut secret) = self.secret.take() {
            secret.zeroize();
        }
        self.signing_key = None;
        true
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field(
                "type",
                &self.tx_json.get("TransactionType").and_then(Value::as_str),
            )
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}
