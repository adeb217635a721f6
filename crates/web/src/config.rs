//! Service configuration.
//!
//! Settings come from an optional TOML file, overridden by CLI flags and
//! `PROJECTGATE_*` environment variables, then validated once. The process
//! refuses to start on an invalid configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::auth::rate_limit::{RateKeyMode, RateLimitConfig};
use crate::auth::secrets::{parse_fallback_list, Secret, SecretRing};

pub const MIN_ACCESS_SECRET_LEN: usize = 16;
pub const MIN_REFRESH_SECRET_LEN: usize = 32;
pub const PASSWORD_MIN_LENGTH_FLOOR: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("{name} must be at least {min} bytes (got {actual})")]
    SecretTooShort {
        name: String,
        min: usize,
        actual: usize,
    },

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Raw settings before validation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HTTP listen address
    pub listen: String,
    /// SQLite path; `:memory:` for an ephemeral store
    pub db_path: String,
    pub access_token_secret: Option<String>,
    /// Comma-separated, most recently retired first
    pub access_token_fallback_secrets: Option<String>,
    pub refresh_token_secret: Option<String>,
    pub refresh_token_fallback_secrets: Option<String>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_window_ms: i64,
    pub rate_limit_key: RateKeyMode,
    pub password_min_length: usize,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            db_path: "projectgate.db".to_string(),
            access_token_secret: None,
            access_token_fallback_secrets: None,
            refresh_token_secret: None,
            refresh_token_fallback_secrets: None,
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 1_209_600,
            rate_limit_max_attempts: 10,
            rate_limit_window_ms: 60_000,
            rate_limit_key: RateKeyMode::Account,
            password_min_length: 12,
            bootstrap_admin_email: None,
            bootstrap_admin_password: None,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &Option<String>| s.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthSettings")
            .field("listen", &self.listen)
            .field("db_path", &self.db_path)
            .field("access_token_secret", &redact(&self.access_token_secret))
            .field(
                "access_token_fallback_secrets",
                &redact(&self.access_token_fallback_secrets),
            )
            .field("refresh_token_secret", &redact(&self.refresh_token_secret))
            .field(
                "refresh_token_fallback_secrets",
                &redact(&self.refresh_token_fallback_secrets),
            )
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("rate_limit_max_attempts", &self.rate_limit_max_attempts)
            .field("rate_limit_window_ms", &self.rate_limit_window_ms)
            .field("rate_limit_key", &self.rate_limit_key)
            .field("password_min_length", &self.password_min_length)
            .field("bootstrap_admin_email", &self.bootstrap_admin_email)
            .field(
                "bootstrap_admin_password",
                &redact(&self.bootstrap_admin_password),
            )
            .finish()
    }
}

/// Bootstrap sysadmin account, created at startup when absent.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Settings that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub listen: SocketAddr,
    pub db_path: String,
    pub access_ring: SecretRing,
    pub refresh_ring: SecretRing,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub rate_limit: RateLimitConfig,
    pub rate_key_mode: RateKeyMode,
    pub password_min_length: usize,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl AuthSettings {
    /// Load settings from file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let listen: SocketAddr = self.listen.parse().map_err(|e| ConfigError::Invalid {
            name: "listen",
            reason: format!("{e}"),
        })?;

        let access_ring = build_ring(
            "access_token_secret",
            self.access_token_secret.as_deref(),
            self.access_token_fallback_secrets.as_deref(),
            MIN_ACCESS_SECRET_LEN,
        )?;
        let refresh_ring = build_ring(
            "refresh_token_secret",
            self.refresh_token_secret.as_deref(),
            self.refresh_token_fallback_secrets.as_deref(),
            MIN_REFRESH_SECRET_LEN,
        )?;

        if self.access_token_ttl_secs <= 0 {
            return Err(ConfigError::Invalid {
                name: "access_token_ttl_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.refresh_token_ttl_secs <= 0 {
            return Err(ConfigError::Invalid {
                name: "refresh_token_ttl_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.rate_limit_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "rate_limit_max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit_window_ms <= 0 {
            return Err(ConfigError::Invalid {
                name: "rate_limit_window_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.password_min_length < PASSWORD_MIN_LENGTH_FLOOR {
            return Err(ConfigError::Invalid {
                name: "password_min_length",
                reason: format!("may not be below {PASSWORD_MIN_LENGTH_FLOOR}"),
            });
        }

        let bootstrap_admin = match (
            non_empty(self.bootstrap_admin_email.as_deref()),
            non_empty(self.bootstrap_admin_password.as_deref()),
        ) {
            (Some(email), Some(password)) => {
                if password.chars().count() < self.password_min_length {
                    return Err(ConfigError::Invalid {
                        name: "bootstrap_admin_password",
                        reason: format!(
                            "must be at least {} characters",
                            self.password_min_length
                        ),
                    });
                }
                Some(BootstrapAdmin {
                    email: email.to_string(),
                    password: password.to_string(),
                })
            }
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("bootstrap_admin_password")),
            (None, Some(_)) => return Err(ConfigError::Missing("bootstrap_admin_email")),
        };

        Ok(ValidatedConfig {
            listen,
            db_path: self.db_path.clone(),
            access_ring,
            refresh_ring,
            access_ttl: Duration::seconds(self.access_token_ttl_secs),
            refresh_ttl: Duration::seconds(self.refresh_token_ttl_secs),
            rate_limit: RateLimitConfig {
                max_attempts: self.rate_limit_max_attempts,
                window: Duration::milliseconds(self.rate_limit_window_ms),
            },
            rate_key_mode: self.rate_limit_key,
            password_min_length: self.password_min_length,
            bootstrap_admin,
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn build_ring(
    name: &'static str,
    active: Option<&str>,
    fallbacks: Option<&str>,
    min_len: usize,
) -> Result<SecretRing, ConfigError> {
    let active = Secret::from(non_empty(active).ok_or(ConfigError::Missing(name))?);
    check_len(name.to_string(), &active, min_len)?;

    let fallbacks = fallbacks.map(parse_fallback_list).unwrap_or_default();
    for (i, secret) in fallbacks.iter().enumerate() {
        check_len(format!("{name} fallback #{}", i + 1), secret, min_len)?;
    }
    Ok(SecretRing::new(active, fallbacks))
}

fn check_len(name: String, secret: &Secret, min: usize) -> Result<(), ConfigError> {
    if secret.len() < min {
        return Err(ConfigError::SecretTooShort {
            name,
            min,
            actual: secret.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AuthSettings {
        AuthSettings {
            access_token_secret: Some("a".repeat(16)),
            refresh_token_secret: Some("r".repeat(32)),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_secrets() {
        let cfg = valid().validate().unwrap();
        assert_eq!(cfg.access_ttl, Duration::seconds(900));
        assert_eq!(cfg.refresh_ttl, Duration::seconds(1_209_600));
        assert_eq!(cfg.rate_limit.max_attempts, 10);
        assert_eq!(cfg.rate_limit.window, Duration::milliseconds(60_000));
        assert_eq!(cfg.password_min_length, 12);
        assert_eq!(cfg.rate_key_mode, RateKeyMode::Account);
        assert!(cfg.bootstrap_admin.is_none());
    }

    #[test]
    fn test_missing_and_short_secrets_fail() {
        let mut s = valid();
        s.access_token_secret = None;
        assert!(matches!(s.validate(), Err(ConfigError::Missing("access_token_secret"))));

        let mut s = valid();
        s.access_token_secret = Some("a".repeat(15));
        assert!(matches!(
            s.validate(),
            Err(ConfigError::SecretTooShort { min: 16, actual: 15, .. })
        ));

        let mut s = valid();
        s.refresh_token_secret = Some("r".repeat(31));
        assert!(matches!(s.validate(), Err(ConfigError::SecretTooShort { min: 32, .. })));
    }

    #[test]
    fn test_fallbacks_parsed_and_checked() {
        let mut s = valid();
        s.access_token_fallback_secrets =
            Some(format!(" {} , , {}", "b".repeat(16), "c".repeat(16)));
        let cfg = s.validate().unwrap();
        assert_eq!(cfg.access_ring.fallbacks().len(), 2);
        assert_eq!(cfg.access_ring.fallbacks()[0].as_bytes(), "b".repeat(16).as_bytes());

        s.refresh_token_fallback_secrets = Some("too-short".to_string());
        assert!(matches!(s.validate(), Err(ConfigError::SecretTooShort { .. })));
    }

    #[test]
    fn test_numeric_bounds() {
        let mut s = valid();
        s.access_token_ttl_secs = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.rate_limit_max_attempts = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.rate_limit_window_ms = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.password_min_length = 7;
        assert!(s.validate().is_err());
        s.password_min_length = 8;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_admin_needs_both_halves() {
        let mut s = valid();
        s.bootstrap_admin_email = Some("root@example.com".to_string());
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Missing("bootstrap_admin_password"))
        ));
        s.bootstrap_admin_password = Some("a long enough password".to_string());
        let cfg = s.validate().unwrap();
        assert_eq!(cfg.bootstrap_admin.unwrap().email, "root@example.com");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projectgate.toml");
        std::fs::write(
            &path,
            r#"
            listen = "0.0.0.0:9000"
            access_token_secret = "0123456789abcdef"
            refresh_token_secret = "0123456789abcdef0123456789abcdef"
            rate_limit_max_attempts = 3
            rate_limit_key = "account_and_client"
            "#,
        )
        .unwrap();

        let settings = AuthSettings::load(&path).unwrap();
        assert_eq!(settings.listen, "0.0.0.0:9000");
        assert_eq!(settings.access_token_ttl_secs, 900);
        let cfg = settings.validate().unwrap();
        assert_eq!(cfg.rate_limit.max_attempts, 3);
        assert_eq!(cfg.rate_key_mode, RateKeyMode::AccountAndClient);

        let missing = AuthSettings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains(&"a".repeat(16)));
        assert!(rendered.contains("<redacted>"));
    }
}
