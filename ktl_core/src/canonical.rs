//! Canonical JSON: sorted keys, explicit number formatting, UTC timestamps,
//! LF line endings (spec §6.3, §9).
//!
//! Round-tripping through [`serde_json::Value`] is enough to get sorted keys:
//! without the `preserve_order` feature, `serde_json::Map` is backed by a
//! `BTreeMap`, so object keys always serialize in sorted order.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value)?;
    let mut bytes = serde_json::to_vec(&as_value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
