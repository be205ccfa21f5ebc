//! End-to-end tests for the Pylon proxy.
//!
//! Each test boots the full stack in-process — SQLite storage, policy store,
//! counter bank, wait queue, proxy and admin routers on ephemeral ports —
//! against a mock downstream server, then drives it over real HTTP:
//!
//! - `proxy_e2e`: authentication, happy-path forwarding, rate caps,
//!   queueing, preemption
//! - `sse_e2e`: streaming passthrough, message accounting, idle timeout,
//!   in-band termination frames
//! - `admin_e2e`: login, key CRUD, policy hot-reload, monitor
//! - `mock_downstream` / `harness`: shared test infrastructure
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod harness;

#[cfg(test)]
mod mock_downstream;

#[cfg(test)]
mod proxy_e2e;

#[cfg(test)]
mod sse_e2e;

#[cfg(test)]
mod admin_e2e;
