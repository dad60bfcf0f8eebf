//! Account addresses and signing seeds
//!
//! Addresses and seeds travel as base58-check strings using the ledger
//! alphabet. Validation happens once, at the type boundary: a constructed
//! [`Address`] or [`Seed`] is always well-formed, so the subscriber maps and
//! the secrets map are keyed by values that cannot be malformed.

use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::RemoteError;

/// Version byte of an account address.
const VERSION_ACCOUNT_ID: u8 = 0;
/// Version byte of a family seed.
const VERSION_FAMILY_SEED: u8 = 33;

/// A validated account address (20-byte account ID, base58-check encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse and validate a base58-check address string.
    pub fn parse(s: &str) -> Result<Self, RemoteError> {
        let payload = decode_check(s, VERSION_ACCOUNT_ID)?;
        if payload.len() != 20 {
            return Err(RemoteError::Config(format!(
                "invalid address length: {} bytes",
                payload.len()
            )));
        }
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw 20-byte account ID.
    pub fn account_id(&self) -> [u8; 20] {
        // Validated at construction; decode cannot fail here.
        let payload = decode_check(&self.0, VERSION_ACCOUNT_ID).expect("validated address");
        let mut id = [0u8; 20];
        id.copy_from_slice(&payload);
        id
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signing seed (16 bytes of entropy). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    entropy: [u8; 16],
}

impl Seed {
    /// Parse and validate a base58-check family-seed string.
    pub fn parse(s: &str) -> Result<Self, RemoteError> {
        let payload = decode_check(s, VERSION_FAMILY_SEED)?;
        if payload.len() != 16 {
            return Err(RemoteError::Config(format!(
                "invalid seed length: {} bytes",
                payload.len()
            )));
        }
        let mut entropy = [0u8; 16];
        entropy.copy_from_slice(&payload);
        Ok(Seed { entropy })
    }

    pub fn from_entropy(entropy: [u8; 16]) -> Self {
        Seed { entropy }
    }

    /// Derive the deterministic signing key for this seed.
    pub fn signing_key(&self) -> SigningKey {
        let digest = Sha512::digest(self.entropy);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&digest[..32]);
        let key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        key
    }

    /// Hex public key with the ed25519 marker byte, as carried in
    /// `SigningPubKey`.
    pub fn public_key_hex(&self) -> String {
        let verifying = self.signing_key().verifying_key();
        format!("ED{}", hex::encode_upper(verifying.to_bytes()))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print entropy.
        f.write_str("Seed(..)")
    }
}

fn decode_check(s: &str, version: u8) -> Result<Vec<u8>, RemoteError> {
    let raw = bs58::decode(s)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_vec()
        .map_err(|e| RemoteError::Config(format!("invalid base58: {e}")))?;
    if raw.len() < 5 {
        return Err(RemoteError::Config("base58 payload too short".into()));
    }
    let (body, checksum) = raw.split_at(raw.len() - 4);
    let digest = Sha256::digest(Sha256::digest(body));
    if digest[..4] != *checksum {
        return Err(RemoteError::Config("base58 checksum mismatch".into()));
    }
    if body[0] != version {
        return Err(RemoteError::Config(format!(
            "unexpected version byte: {}",
            body[0]
        )));
    }
    Ok(body[1..].to_vec())
}

/// Base58-check encode with the ledger alphabet. Used by tests and demo
/// tooling to build fixture addresses and seeds.
pub fn encode_check(version: u8, payload: &[u8]) -> String {
    let mut body = Vec::with_capacity(payload.len() + 5);
    body.push(version);
    body.extend_from_slice(payload);
    let digest = Sha256::digest(Sha256::digest(&body));
    body.extend_from_slice(&digest[..4]);
    bs58::encode(body)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_string()
}
