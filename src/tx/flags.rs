//! Transaction flag bitfields
//!
//! The `Flags` field is an unsigned 32-bit bitfield. The high bit requests
//! a canonical (malleability-resistant) signature and is valid on every
//! transaction type; the rest are per-type.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Universal: constrain the signature to its canonical form.
pub const TF_FULLY_CANONICAL_SIG: u32 = 0x8000_0000;

type FlagTable = HashMap<&'static str, &'static [(&'static str, u32)]>;

/// Named flags per transaction type.
pub static TRANSACTION_FLAGS: Lazy<FlagTable> = Lazy::new(|| {
    let mut table: FlagTable = HashMap::new();
    table.insert(
        "Payment",
        &[
            ("NoDirectRipple", 0x0001_0000),
            ("PartialPayment", 0x0002_0000),
            ("LimitQuality", 0x0004_0000),
        ][..],
    );
    table.insert(
        "OfferCreate",
        &[
            ("Passive", 0x0001_0000),
            ("ImmediateOrCancel", 0x0002_0000),
            ("FillOrKill", 0x0004_0000),
            ("Sell", 0x0008_0000),
        ][..],
    );
    table.insert(
        "AccountSet",
        &[
            ("RequireDestTag", 0x0001_0000),
            ("OptionalDestTag", 0x0002_0000),
            ("RequireAuth", 0x0004_0000),
            ("OptionalAuth", 0x0008_0000),
            ("DisallowNative", 0x0010_0000),
            ("AllowNative", 0x0020_0000),
        ][..],
    );
    table.insert(
        "TrustSet",
        &[
            ("SetAuth", 0x0001_0000),
            ("NoRipple", 0x0002_0000),
            ("ClearNoRipple", 0x0004_0000),
            ("SetFreeze", 0x0010_0000),
            ("ClearFreeze", 0x0020_0000),
        ][..],
    );
    table
});

/// Resolve a named flag for a transaction type.
pub fn flag_value(tx_type: &str, name: &str) -> Option<u32> {
    TRANSACTION_FLAGS
        .get(tx_type)?
        .iter()
        .find(|(flag, _)| *flag == name)
        .map(|(_, bit)| *bit)
}
