//! Admission limits: counter accounting and API identifier derivation.
//!
//! The [`CounterBank`](counters::CounterBank) owns every gauge and sliding
//! window the admission decision reads; [`pattern`] turns a method and path
//! into the API identifier those counters (and the request log) are keyed by.

pub mod counters;
pub mod pattern;

pub use counters::{BankSnapshot, CounterBank, Reservation};
pub use pattern::{resolve_api, ApiMatch};

use crate::{
    auth::api_key::ApiKey,
    policy::{LimitRule, PolicySnapshot},
};

/// What kind of concurrency slot a request occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Unary,
    Sse,
}

/// The first cap a reserve attempt ran into.
///
/// Evaluation order is fixed — user rpm, api rpm, global rpm, then the
/// concurrency caps — so the variant is deterministic for a given state.
/// Rate denials are terminal (429); concurrency denials are queueable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deny {
    UserRate,
    ApiRate,
    GlobalRate,
    UserConcurrency,
    GlobalConcurrency,
    UserSse,
    GlobalSse,
}

impl Deny {
    /// Rate denials reject immediately; everything else waits in the queue.
    #[must_use]
    pub fn is_rate(&self) -> bool {
        matches!(self, Self::UserRate | Self::ApiRate | Self::GlobalRate)
    }

    /// Stable machine-readable code for rejection bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserRate | Self::UserConcurrency | Self::UserSse => "user_limit",
            Self::ApiRate => "api_limit",
            Self::GlobalRate | Self::GlobalConcurrency | Self::GlobalSse => "system_busy",
        }
    }

    /// Human message for rejection bodies.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::UserRate => "Your request rate limit exceeded",
            Self::ApiRate => "API rate limit exceeded",
            Self::GlobalRate => "System request rate limit exceeded",
            Self::UserConcurrency => "Your concurrent request limit exceeded",
            Self::GlobalConcurrency => "System busy, please try again later",
            Self::UserSse => "Your SSE connection limit exceeded",
            Self::GlobalSse => "System SSE connection limit exceeded",
        }
    }
}

/// The caps one reserve attempt is evaluated against, resolved from the
/// policy snapshot and the identity's overrides before the bank is touched.
#[derive(Debug, Clone, Copy)]
pub struct CheckRules {
    pub user: LimitRule,
    /// Rate cap for the matched API identifier, when one is configured.
    pub api_rpm: Option<u32>,
    pub global: LimitRule,
}

impl CheckRules {
    /// Resolves the effective rules for one request. A per-identity override
    /// replaces the default user rule wholesale.
    #[must_use]
    pub fn resolve(snapshot: &PolicySnapshot, identity: &ApiKey, api: &ApiMatch) -> Self {
        Self {
            user: identity.limit_overrides.unwrap_or(snapshot.rate_limit.default_user),
            api_rpm: api.rule.and_then(|r| r.max_requests_per_minute),
            global: snapshot.rate_limit.global_limit,
        }
    }

    /// Rules with every cap open; used by paths that only need accounting.
    #[must_use]
    pub fn unlimited() -> Self {
        Self { user: LimitRule::default(), api_rpm: None, global: LimitRule::default() }
    }
}
