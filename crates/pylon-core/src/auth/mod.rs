//! API key authentication.
//!
//! Credentials are opaque `sk-` tokens; only their SHA-256 hash is stored.
//! Resolution hashes the presented credential, looks the hash up in the
//! repository, and then evaluates lifecycle state, distinguishing
//! not-found, expired, and revoked so the proxy can say why a request was
//! turned away (all three map to 401).
//!
//! The plaintext credential leaves this module exactly twice: from
//! [`KeyStore::create`] and [`KeyStore::refresh`]. It is never persisted and
//! never logged.

pub mod api_key;
pub mod repository;

use api_key::{ApiKey, Priority};
use chrono::{Duration, Utc};
use repository::{KeyCounts, KeyRepository, KeyUpdate};
use std::sync::Arc;
use thiserror::Error;

use crate::policy::LimitRule;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(String),

    #[error("key generation error: {0}")]
    KeyGeneration(String),

    #[error("api key not found")]
    NotFound,

    #[error("api key must be revoked or expired before deletion")]
    StillActive,
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Database(err.to_string())
    }
}

/// Outcome of resolving a presented credential.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ApiKey),
    NotFound,
    Expired,
    Revoked,
}

impl Resolution {
    /// Human reason for the 401 body on non-resolved outcomes.
    #[must_use]
    pub fn deny_reason(&self) -> Option<&'static str> {
        match self {
            Self::Resolved(_) => None,
            Self::NotFound => Some("Invalid API key"),
            Self::Expired => Some("API key expired"),
            Self::Revoked => Some("API key revoked"),
        }
    }
}

/// Extracts the credential from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// High-level key operations over a [`KeyRepository`].
pub struct KeyStore {
    repository: Arc<dyn KeyRepository>,
}

impl KeyStore {
    pub fn new(repository: Arc<dyn KeyRepository>) -> Self {
        Self { repository }
    }

    /// Resolves a presented credential to an identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Database`] only on storage failure; bad
    /// credentials come back as a [`Resolution`] variant, not an error.
    pub async fn resolve(&self, presented: &str) -> Result<Resolution, AuthError> {
        let hash = ApiKey::hash_key(presented);
        let Some(key) = self.repository.find_by_hash(&hash).await? else {
            return Ok(Resolution::NotFound);
        };

        if key.is_revoked() {
            return Ok(Resolution::Revoked);
        }
        if key.is_expired(Utc::now()) {
            return Ok(Resolution::Expired);
        }
        Ok(Resolution::Resolved(key))
    }

    /// Creates a key and returns `(plaintext, record)`. The plaintext is not
    /// recoverable afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyGeneration`] if the RNG fails or
    /// [`AuthError::Database`] if the insert fails.
    pub async fn create(
        &self,
        description: String,
        priority: Priority,
        expires_in_days: Option<i64>,
        limit_overrides: Option<LimitRule>,
    ) -> Result<(String, ApiKey), AuthError> {
        let plaintext = ApiKey::generate()?;
        let now = Utc::now();

        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            key_hash: ApiKey::hash_key(&plaintext),
            key_prefix: ApiKey::display_prefix(&plaintext),
            description,
            priority,
            created_at: now,
            expires_at: expires_in_days.map(|days| now + Duration::days(days)),
            revoked_at: None,
            limit_overrides,
        };

        self.repository.insert(&key).await?;
        tracing::info!(key_id = %key.id, prefix = %key.key_prefix, "api key created");
        Ok((plaintext, key))
    }

    /// Regenerates the credential for an existing key, keeping its identity
    /// and settings. The previous credential stops resolving immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown id.
    pub async fn refresh(&self, id: &str) -> Result<(String, ApiKey), AuthError> {
        let plaintext = ApiKey::generate()?;
        let hash = ApiKey::hash_key(&plaintext);
        let prefix = ApiKey::display_prefix(&plaintext);

        let key = self
            .repository
            .replace_credential(id, &hash, &prefix)
            .await?
            .ok_or(AuthError::NotFound)?;
        tracing::info!(key_id = %key.id, prefix = %key.key_prefix, "api key refreshed");
        Ok((plaintext, key))
    }

    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown id.
    pub async fn revoke(&self, id: &str) -> Result<ApiKey, AuthError> {
        let key =
            self.repository.set_revoked(id, Utc::now()).await?.ok_or(AuthError::NotFound)?;
        tracing::info!(key_id = %key.id, "api key revoked");
        Ok(key)
    }

    /// Permanently removes a key. Only revoked or expired keys may be
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::StillActive`] when the key is still usable and
    /// [`AuthError::NotFound`] for an unknown id.
    pub async fn delete(&self, id: &str) -> Result<(), AuthError> {
        let key = self.repository.find_by_id(id).await?.ok_or(AuthError::NotFound)?;
        if key.is_valid(Utc::now()) {
            return Err(AuthError::StillActive);
        }
        self.repository.delete(id).await?;
        tracing::info!(key_id = %id, "api key deleted");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown id.
    pub async fn update(&self, id: &str, update: KeyUpdate) -> Result<ApiKey, AuthError> {
        self.repository.update_metadata(id, update).await?.ok_or(AuthError::NotFound)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown id.
    pub async fn get(&self, id: &str) -> Result<ApiKey, AuthError> {
        self.repository.find_by_id(id).await?.ok_or(AuthError::NotFound)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::Database`] on storage failure.
    pub async fn list(
        &self,
        include_revoked: bool,
        include_expired: bool,
    ) -> Result<Vec<ApiKey>, AuthError> {
        self.repository.list(include_revoked, include_expired).await
    }

    /// # Errors
    ///
    /// Returns [`AuthError::Database`] on storage failure.
    pub async fn counts(&self) -> Result<KeyCounts, AuthError> {
        self.repository.counts().await
    }
}
