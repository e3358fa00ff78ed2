//! Ed25519 signing key plumbing for `ktl bundle seal`/`ktl bundle verify`.

use ed25519_dalek::{SigningKey, VerifyingKey};
use ktl_core::error::{Error, Result};
use rand::rngs::OsRng;
use std::path::Path;

/// Loads a raw 32-byte signing key from `path` if it exists, generates and
/// persists a fresh one there if it doesn't, or generates an ephemeral key
/// that is never written to disk if `path` is `None`.
pub fn load_or_generate(path: Option<&Path>) -> Result<SigningKey> {
    match path {
        Some(path) if path.exists() => {
            let bytes = std::fs::read(path).map_err(Error::Io)?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::Signature("signing key file must be exactly 32 bytes".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        Some(path) => {
            let key = SigningKey::generate(&mut OsRng);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(Error::Io)?;
            }
            std::fs::write(path, key.to_bytes()).map_err(Error::Io)?;
            Ok(key)
        }
        None => Ok(SigningKey::generate(&mut OsRng)),
    }
}

/// Parses a hex-encoded Ed25519 public key, as accepted by `--trusted-key`.
pub fn parse_trusted_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key).map_err(|e| Error::Signature(format!("invalid public key hex: {e}")))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::Signature("public key is not 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Signature(format!("invalid public key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_and_reuses_a_persisted_key() {
        let td = tempdir().unwrap();
        let path = td.path().join("signing.key");

        let first = load_or_generate(Some(&path)).unwrap();
        let second = load_or_generate(Some(&path)).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn ephemeral_key_requires_no_path() {
        let key = load_or_generate(None).unwrap();
        assert_eq!(key.to_bytes().len(), 32);
    }

    #[test]
    fn trusted_key_round_trips_through_hex() {
        let key = SigningKey::generate(&mut OsRng);
        let hex_key = hex::encode(key.verifying_key().to_bytes());
        let parsed = parse_trusted_key(&hex_key).unwrap();
        assert_eq!(parsed.to_bytes(), key.verifying_key().to_bytes());
    }
}
