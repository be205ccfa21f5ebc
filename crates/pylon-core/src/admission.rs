//! The admission controller: one entry point from "authenticated request"
//! to "ticket, rejection, or queue wait".
//!
//! Evaluation is sequential — user, api, global — with rate caps before
//! concurrency caps, so the rejection reason is deterministic. Rate denials
//! reject immediately with 429; concurrency denials hand the request to the
//! wait queue, whose outcome maps onto 503/504 per the rejection table.

use crate::{
    auth::api_key::{ApiKey, Priority},
    limits::{ApiMatch, CheckRules, CounterBank, Deny, Reservation, TicketKind},
    policy::{PolicyHandle, PolicySnapshot},
    queue::{JoinOutcome, QueueRequest, WaitQueue},
};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The right to occupy one concurrency slot until drop.
///
/// Dropping the ticket releases the slot exactly once, on every exit path;
/// the response handler keeps it alive for as long as bytes flow.
#[derive(Debug)]
pub struct Ticket {
    identity_id: String,
    api: String,
    kind: TicketKind,
    priority: Priority,
    enqueued_at: Option<DateTime<Utc>>,
    admitted_at: DateTime<Utc>,
    // Held for its Drop; the gauges release through it.
    #[allow(dead_code)]
    reservation: Reservation,
}

impl Ticket {
    #[must_use]
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    #[must_use]
    pub fn api(&self) -> &str {
        &self.api
    }

    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }

    #[must_use]
    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }
}

/// A refused request, ready to serialize per the rejection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn unauthorized(reason: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: reason.to_string(),
        }
    }

    #[must_use]
    pub fn rate_limited(deny: Deny) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: deny.code(),
            message: deny.message().to_string(),
        }
    }

    #[must_use]
    pub fn queue_full() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "queue_full",
            message: "Queue is full".to_string(),
        }
    }

    #[must_use]
    pub fn queue_timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            code: "queue_timeout",
            message: "Queue wait timeout".to_string(),
        }
    }

    #[must_use]
    pub fn preempted() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "preempted",
            message: "Request preempted by higher priority".to_string(),
        }
    }

    #[must_use]
    pub fn downstream_error(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "downstream_error",
            message: message.to_string(),
        }
    }
}

pub struct AdmissionController {
    bank: CounterBank,
    queue: WaitQueue,
    policy: Arc<PolicyHandle>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(bank: CounterBank, queue: WaitQueue, policy: Arc<PolicyHandle>) -> Self {
        Self { bank, queue, policy }
    }

    #[must_use]
    pub fn bank(&self) -> &CounterBank {
        &self.bank
    }

    #[must_use]
    pub fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    /// Derives the API identifier and its attached rate rule.
    #[must_use]
    pub fn resolve_api(&self, method: &str, path: &str, snapshot: &PolicySnapshot) -> ApiMatch {
        crate::limits::resolve_api(method, path, &snapshot.rate_limit)
    }

    /// Admits, rejects, or queues one authenticated request.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] carrying the status and stable code for every
    /// refusal path: 429 for rate caps, 503 `queue_full`/`preempted`, and
    /// 504 `queue_timeout`.
    pub async fn admit(
        &self,
        identity: &ApiKey,
        api: &ApiMatch,
        is_sse: bool,
        snapshot: &PolicySnapshot,
    ) -> Result<Ticket, Rejection> {
        let kind = if is_sse { TicketKind::Sse } else { TicketKind::Unary };
        let rules = CheckRules::resolve(snapshot, identity, api);

        match self.bank.try_reserve(&identity.id, &api.identifier, kind, &rules) {
            Ok(reservation) => Ok(Ticket {
                identity_id: identity.id.clone(),
                api: api.identifier.clone(),
                kind,
                priority: identity.priority,
                enqueued_at: None,
                admitted_at: Utc::now(),
                reservation,
            }),
            Err(deny) if deny.is_rate() => Err(Rejection::rate_limited(deny)),
            Err(_concurrency) => self.wait_for_slot(identity, api, kind, snapshot).await,
        }
    }

    async fn wait_for_slot(
        &self,
        identity: &ApiKey,
        api: &ApiMatch,
        kind: TicketKind,
        snapshot: &PolicySnapshot,
    ) -> Result<Ticket, Rejection> {
        let enqueued_at = Utc::now();
        tracing::debug!(
            identity = %identity.id,
            api = %api.identifier,
            priority = %identity.priority,
            "concurrency full, joining wait queue"
        );

        let outcome = self
            .queue
            .join(
                &self.bank,
                &self.policy,
                QueueRequest {
                    identity: identity.id.clone(),
                    api: api.identifier.clone(),
                    kind,
                    priority: identity.priority,
                    limit_overrides: identity.limit_overrides,
                },
                &snapshot.queue,
            )
            .await;

        match outcome {
            JoinOutcome::Admitted(reservation) => Ok(Ticket {
                identity_id: identity.id.clone(),
                api: api.identifier.clone(),
                kind,
                priority: identity.priority,
                enqueued_at: Some(enqueued_at),
                admitted_at: Utc::now(),
                reservation,
            }),
            JoinOutcome::RateLimited(deny) => Err(Rejection::rate_limited(deny)),
            JoinOutcome::Full => Err(Rejection::queue_full()),
            JoinOutcome::Timeout => Err(Rejection::queue_timeout()),
            JoinOutcome::Preempted => Err(Rejection::preempted()),
        }
    }
}
