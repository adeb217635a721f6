//! Hashing helpers for credentials that are stored by digest only.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a raw secret (API key or refresh token).
pub fn hash_secret(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, non-reversible fingerprint suitable for logs.
pub fn fingerprint(material: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material);
    hex::encode(&hasher.finalize()[..4])
}

/// Hex-encoded random token of `len` bytes from the OS RNG.
pub fn generate_token(len: usize) -> String {
    let mut raw = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Length-checked comparison that does not short-circuit on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        v |= x ^ y;
    }
    v == 0
}
