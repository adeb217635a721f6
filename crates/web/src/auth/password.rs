//! Password hashing using Argon2

use argon2::{
    password_hash::{rand_core::OsRng as ArgonOsRng, PasswordHash, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, PasswordHasher, Version,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
}

/// Password hashing service using Argon2id
#[derive(Clone)]
pub struct PasswordService {
    argon2: Argon2<'static>,
    /// Hash verified against when the account does not exist, so both
    /// branches of a login cost the same.
    dummy_hash: String,
}

impl PasswordService {
    /// Service with the argon2 crate's default cost
    pub fn new() -> Result<Self, PasswordError> {
        Self::from_argon2(Argon2::default())
    }

    /// Service with explicit memory (KiB), iteration and parallelism costs
    pub fn with_cost(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, PasswordError> {
        let params = Params::new(m_cost, t_cost, p_cost, None)
            .map_err(|e| PasswordError::Params(e.to_string()))?;
        Self::from_argon2(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    fn from_argon2(argon2: Argon2<'static>) -> Result<Self, PasswordError> {
        let mut service = Self {
            argon2,
            dummy_hash: String::new(),
        };
        let filler = projectgate_common::crypto::generate_token(16);
        service.dummy_hash = service.hash_password(&filler)?;
        Ok(service)
    }

    /// Hash a password into PHC string format
    pub fn hash_password(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut ArgonOsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| PasswordError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored hash. Unparseable hashes never match.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Burn the same work as a real verification, then fail.
    pub fn verify_dummy(&self, password: &str) -> bool {
        let _ = self.verify_password(password, &self.dummy_hash);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> PasswordService {
        PasswordService::with_cost(8, 1, 1).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let service = cheap();
        let hash = service.hash_password("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(service.verify_password("correct horse battery", &hash));
        assert!(!service.verify_password("wrong horse battery", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let service = cheap();
        let a = service.hash_password("same password!").unwrap();
        let b = service.hash_password("same password!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_garbage_hash_and_dummy_never_match() {
        let service = cheap();
        assert!(!service.verify_password("anything", "not-a-phc-string"));
        assert!(!service.verify_dummy("anything"));
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(PasswordService::with_cost(0, 0, 0).is_err());
    }
}
