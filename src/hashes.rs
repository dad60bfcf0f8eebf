//! Domain-separated hashing
//!
//! Every hash the runtime computes is SHA-512 truncated to its first 32
//! bytes, with a 4-byte ASCII-derived prefix (last byte zero) identifying
//! the hash domain. Signing input is the canonical serialization of the
//! transaction JSON: object keys sorted lexicographically at every level,
//! no insignificant whitespace.

use serde_json::Value;
use sha2::{Digest, Sha512};

/// Transaction-ID prefix (`TXN\0`).
pub const HASH_TX_ID: u32 = 0x5458_4E00;
/// Transaction-node prefix (`SND\0`).
pub const HASH_TX_NODE: u32 = 0x534E_4400;
/// Inner-node prefix (`MIN\0`).
pub const HASH_INNER_NODE: u32 = 0x4D49_4E00;
/// Leaf-node prefix (`MLN\0`).
pub const HASH_LEAF_NODE: u32 = 0x4D4C_4E00;
/// Signing-hash prefix (`STX\0`).
pub const HASH_TX_SIGN: u32 = 0x5354_5800;
/// Testnet signing-hash prefix (`stx\0`).
pub const HASH_TX_SIGN_TESTNET: u32 = 0x7374_7800;
/// Multi-sign prefix (`SMT\0`).
pub const HASH_TX_MULTISIGN: u32 = 0x534D_5400;

/// SHA-512 truncated to 256 bits over `prefix ++ data`.
pub fn sha512_half(prefix: u32, data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha512::new();
    hasher.update(prefix.to_be_bytes());
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

/// Canonical byte serialization of a JSON value: compact, with object keys
/// emitted in lexicographic order at every nesting level. Two structurally
/// equal values always serialize to identical bytes.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // Keys are plain JSON strings; serde handles escaping.
                out.extend_from_slice(
                    serde_json::to_string(key).expect("string serialization").as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        other => {
            out.extend_from_slice(
                serde_json::to_string(other).expect("scalar serialization").as_bytes(),
            );
        }
    }
}

/// Signing hash of a transaction JSON body.
pub fn signing_hash(tx_json: &Value, testnet: bool) -> [u8; 32] {
    let prefix = if testnet { HASH_TX_SIGN_TESTNET } else { HASH_TX_SIGN };
    sha512_half(prefix, &canonical_json(tx_json))
}

/// Transaction ID: the identifying hash of a fully signed transaction.
pub fn transaction_id(tx_json: &Value) -> [u8; 32] {
    sha512_half(HASH_TX_ID, &canonical_json(tx_json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefixes_match_ascii_derivation() {
        assert_eq!(&HASH_TX_ID.to_be_bytes()[..3], b"TXN");
        assert_eq!(&HASH_TX_SIGN.to_be_bytes()[..3], b"STX");
        assert_eq!(&HASH_TX_SIGN_TESTNET.to_be_bytes()[..3], b"stx");
        assert_eq!(&HASH_TX_MULTISIGN.to_be_bytes()[..3], b"SMT");
        assert_eq!(HASH_TX_ID.to_be_bytes()[3], 0);
        assert_eq!(HASH_INNER_NODE.to_be_bytes()[3], 0);
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_level() {
        let a = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        let b = json!({"a": {"m": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            String::from_utf8(canonical_json(&a)).unwrap(),
            r#"{"a":{"m":[1,2],"z":true},"b":1}"#
        );
    }

    #[test]
    fn signing_hash_is_stable_and_domain_separated() {
        let tx = json!({"TransactionType": "Payment", "Account": "rHb9", "Fee": "12"});
        let h1 = signing_hash(&tx, false);
        let h2 = signing_hash(&tx, false);
        assert_eq!(h1, h2);
        // Different domain prefix, different hash.
        assert_ne!(signing_hash(&tx, false), signing_hash(&tx, true));
        assert_ne!(signing_hash(&tx, false), transaction_id(&tx));
    }

    #[test]
    fn key_order_does_not_change_signing_hash() {
        let a = json!({"Fee": "12", "Account": "rHb9", "TransactionType": "Payment"});
        let b = json!({"TransactionType": "Payment", "Fee": "12", "Account": "rHb9"});
        assert_eq!(signing_hash(&a, false), signing_hash(&b, false));
    }
}
