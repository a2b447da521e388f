use anyhow::Result;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};

use crate::utils::colon_hex;

/// Decode the base64 key blob of an authorized_keys entry.
pub fn parse_key_data(data: &str) -> Result<PublicKey> {
    russh::keys::parse_public_key_base64(data)
        .map_err(|e| anyhow::anyhow!("failed to parse public key: {}", e))
}

/// Two keys are the same credential when their key material is identical;
/// comments are ignored.
pub fn same_key(a: &PublicKey, b: &PublicKey) -> bool {
    a.key_data() == b.key_data()
}

fn key_digest(key: &PublicKey) -> Vec<u8> {
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64())
        .unwrap_or_default();
    Sha256::digest(&key_bytes).to_vec()
}

/// OpenSSH style fingerprint: `SHA256:<unpadded base64 of the key blob digest>`.
pub fn fingerprint(key: &PublicKey) -> String {
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(key_digest(key));
    format!("SHA256:{}", b64)
}

/// The same digest as [`fingerprint`], as colon separated hex pairs.
pub fn fingerprint_hex(key: &PublicKey) -> String {
    colon_hex(&key_digest(key))
}
