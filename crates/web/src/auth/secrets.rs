//! Signing secrets per token class.
//!
//! A ring holds one active secret, used for signing, and an ordered list of
//! retired secrets that are still accepted for verification. Rings are built
//! once at startup and never mutated; rotation means restarting with a new
//! configuration where the old active secret is the first fallback.

use projectgate_common::crypto::fingerprint;
use std::fmt;

/// Raw secret material. Redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Non-reversible short identifier safe to log.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(fp={})", self.fingerprint())
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

#[derive(Clone, Debug)]
pub struct SecretRing {
    active: Secret,
    /// Most recently retired first
    fallbacks: Vec<Secret>,
}

impl SecretRing {
    pub fn new(active: impl Into<Secret>, fallbacks: Vec<Secret>) -> Self {
        Self {
            active: active.into(),
            fallbacks,
        }
    }

    pub fn active(&self) -> &Secret {
        &self.active
    }

    pub fn fallbacks(&self) -> &[Secret] {
        &self.fallbacks
    }

    /// Active secret first, then fallbacks in order.
    pub fn verification_order(&self) -> impl Iterator<Item = &Secret> {
        std::iter::once(&self.active).chain(self.fallbacks.iter())
    }

    /// The ring an operator would deploy next: `new_active` signs, the
    /// current active secret becomes the first fallback.
    pub fn rotated(&self, new_active: impl Into<Secret>) -> Self {
        let mut fallbacks = Vec::with_capacity(self.fallbacks.len() + 1);
        fallbacks.push(self.active.clone());
        fallbacks.extend(self.fallbacks.iter().cloned());
        Self {
            active: new_active.into(),
            fallbacks,
        }
    }
}

/// Parse a comma-separated fallback list. Entries are trimmed and empty
/// entries dropped; order is kept.
pub fn parse_fallback_list(raw: &str) -> Vec<Secret> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Secret::from)
        .collect()
}
