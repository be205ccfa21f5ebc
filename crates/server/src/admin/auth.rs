//! Admin login and bearer-token verification.
//!
//! Login compares the presented password's SHA-256 against the configured
//! hash (constant-time) and issues a stateless signed token:
//! `hex(payload) "." hex(HMAC-SHA256(secret, payload))`, where the payload
//! carries the expiry. Verification recomputes the MAC and checks the TTL.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use pylon_core::{auth::extract_bearer, config::AdminConfig};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

pub struct AdminAuth {
    password_hash: String,
    secret: Vec<u8>,
    ttl: Duration,
}

impl AdminAuth {
    #[must_use]
    pub fn from_config(config: &AdminConfig) -> Self {
        Self {
            password_hash: config.password_hash.clone(),
            secret: config.token_secret.as_bytes().to_vec(),
            ttl: Duration::hours(i64::try_from(config.token_ttl_hours).unwrap_or(24)),
        }
    }

    /// Login is only possible when both a password hash and a signing secret
    /// are configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.password_hash.is_empty() && !self.secret.is_empty()
    }

    /// Verifies the password and issues a token with its expiry time.
    #[must_use]
    pub fn login(&self, password: &str) -> Option<(String, DateTime<Utc>)> {
        if !self.enabled() {
            return None;
        }

        let presented = hex::encode(Sha256::digest(password.as_bytes()));
        let matches: bool = presented
            .as_bytes()
            .ct_eq(self.password_hash.as_bytes())
            .into();
        if !matches {
            return None;
        }

        let expires_at = Utc::now() + self.ttl;
        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new().fill(&mut nonce).ok()?;
        let payload = format!("admin:{}:{}", expires_at.timestamp(), hex::encode(nonce));

        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        Some((format!("{}.{}", hex::encode(&payload), hex::encode(signature)), expires_at))
    }

    /// Checks the signature and the embedded expiry.
    #[must_use]
    pub fn verify(&self, token: &str) -> bool {
        if !self.enabled() {
            return false;
        }

        let Some((payload_hex, signature_hex)) = token.split_once('.') else {
            return false;
        };
        let (Ok(payload), Ok(signature)) = (hex::decode(payload_hex), hex::decode(signature_hex))
        else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(&payload);
        if mac.verify_slice(&signature).is_err() {
            return false;
        }

        let Ok(payload) = String::from_utf8(payload) else {
            return false;
        };
        let mut parts = payload.split(':');
        if parts.next() != Some("admin") {
            return false;
        }
        let Some(Ok(expiry)) = parts.next().map(str::parse::<i64>) else {
            return false;
        };

        Utc::now().timestamp() < expiry
    }
}

/// Middleware guarding every management route except login and health.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match extract_bearer(bearer) {
        Some(token) if state.admin_auth.verify(token) => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
