//! # Pylon Core
//!
//! Core library for Pylon, an authenticating HTTP reverse proxy that sits
//! between clients and a single downstream API.
//!
//! The crate is organized around the request-admission pipeline:
//!
//! - **[`auth`]**: API key records, the SQLite-backed repository, and the
//!   [`KeyStore`](auth::KeyStore) that resolves presented credentials.
//!
//! - **[`limits`]**: the [`CounterBank`](limits::CounterBank) — atomic
//!   concurrency gauges and 60-second sliding rate windows keyed by
//!   (dimension, identity) — plus API-identifier derivation.
//!
//! - **[`admission`]**: the controller that evaluates user → api → global
//!   caps and either admits, rejects, or parks a request in the wait queue.
//!   Admitted requests hold a [`Ticket`](admission::Ticket) that releases
//!   its slot exactly once on every exit path.
//!
//! - **[`queue`]**: the bounded priority wait queue with preemption,
//!   per-entry deadlines, and one-shot resolution channels.
//!
//! - **[`proxy`]**: the forwarding engine — transparent unary passthrough
//!   and SSE streaming with message-level rate accounting, idle timeout,
//!   and in-band error events.
//!
//! - **[`recorder`]**: fire-and-forget completion records flushed to the
//!   request log by a background worker.
//!
//! - **[`policy`]**: the dynamic, hot-reloadable policy snapshot, and
//!   **[`config`]**: static process configuration.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌────────────┐
//! │  KeyStore  │ ─── unknown/expired/revoked ──► 401
//! └─────┬──────┘
//!       ▼
//! ┌────────────────────┐
//! │ AdmissionController│ ─── rate cap hit ──► 429
//! │   (CounterBank)    │ ─── concurrency full ──► WaitQueue ──► 503/504
//! └─────┬──────────────┘
//!       ▼
//! ┌────────────┐      ┌────────────┐
//! │ ProxyEngine│ ───► │ downstream │
//! └─────┬──────┘      └────────────┘
//!       ▼
//!  slot released, Recorder notified
//! ```

pub mod admission;
pub mod auth;
pub mod config;
pub mod limits;
pub mod policy;
pub mod proxy;
pub mod queue;
pub mod recorder;
pub mod stats;
