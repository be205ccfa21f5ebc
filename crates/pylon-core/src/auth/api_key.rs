use crate::{auth::AuthError, policy::LimitRule};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Scheduling priority attached to an API key.
///
/// Priority orders waiters in the admission queue (high > normal > low) and
/// decides who may preempt whom when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Queue ordering rank; lower ranks are served first.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Parse a priority from its stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored record for one API key.
///
/// Only the SHA-256 hash of the credential is persisted; the plaintext key is
/// returned exactly once, at creation or refresh. `key_prefix` keeps the
/// first characters around for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Stable identifier (UUID v4).
    pub id: String,
    /// Hex SHA-256 of the plaintext credential.
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Display prefix, e.g. `sk-a1b2`.
    pub key_prefix: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Per-identity cap overrides; `None` falls back to the policy default.
    pub limit_overrides: Option<LimitRule>,
}

const KEY_PREFIX: &str = "sk-";
const KEY_RANDOM_LENGTH: usize = 32;
/// Display prefix length: `sk-` plus four characters.
const PREFIX_DISPLAY_LENGTH: usize = 7;

impl ApiKey {
    /// Generates a fresh credential: `sk-` followed by 32 characters drawn
    /// from `[a-z0-9]` with a cryptographically secure source.
    ///
    /// Rejection sampling keeps the distribution uniform across the 36-char
    /// alphabet; without it, bytes ≥ 252 would skew the first four characters.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyGeneration`] if the system RNG fails.
    pub fn generate() -> Result<String, AuthError> {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        const CHARSET_LEN: usize = 36;
        #[allow(clippy::cast_possible_truncation)]
        const MAX_UNBIASED: u8 = (256 / CHARSET_LEN * CHARSET_LEN - 1) as u8;

        let rng = SystemRandom::new();
        let mut key = String::with_capacity(KEY_PREFIX.len() + KEY_RANDOM_LENGTH);
        key.push_str(KEY_PREFIX);

        for _ in 0..KEY_RANDOM_LENGTH {
            loop {
                let mut byte = [0u8; 1];
                rng.fill(&mut byte)
                    .map_err(|_| AuthError::KeyGeneration("system RNG unavailable".to_string()))?;

                if byte[0] <= MAX_UNBIASED {
                    key.push(CHARSET[byte[0] as usize % CHARSET_LEN] as char);
                    break;
                }
            }
        }

        Ok(key)
    }

    /// Hex SHA-256 of a plaintext credential. Verification is hash-compare
    /// against the stored value.
    #[must_use]
    pub fn hash_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Display prefix of a plaintext credential (`sk-` plus four characters).
    #[must_use]
    pub fn display_prefix(key: &str) -> String {
        key.chars().take(PREFIX_DISPLAY_LENGTH).collect()
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// A key is usable when it is neither expired nor revoked.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_revoked()
    }
}
