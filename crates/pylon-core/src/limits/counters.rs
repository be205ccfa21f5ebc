//! The Counter Bank: every gauge and sliding window admission reads.
//!
//! Two counter families exist per (dimension, key):
//!
//! - **Gauges** track active work: global and per-identity concurrent unary
//!   requests, and global and per-identity active SSE connections. They are
//!   plain atomics incremented by a successful reserve and decremented by
//!   [`Reservation`] drop.
//!
//! - **Windows** track frequency: one timestamp per event, aggregated over
//!   the trailing window (60 seconds in production) on every read. Unary
//!   admissions and forwarded SSE messages share the same windows, so N
//!   requests plus M messages by one identity count as N+M.
//!
//! A reserve is linearizable with respect to other reserves and releases on
//! the same keys: the identity, api, and global window cells are locked in
//! that fixed order for the whole check-then-commit, and the gauge pair is
//! taken with compare-and-swap, rolling back the user gauge when the global
//! gauge refuses. The first violated cap names the [`Deny`] variant, in the
//! fixed user-rpm → api-rpm → global-rpm → concurrency order.
//!
//! Per-identity cells are created lazily and swept once idle for longer than
//! the window. A [`Reservation`] keeps an `Arc` to its cell so a release
//! always balances the increment it came from, even across a sweep.

use super::{CheckRules, Deny, TicketKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

/// Sliding-window length for all rate counters.
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct GaugeCell(AtomicI64);

impl GaugeCell {
    /// Increments unless the cap would be breached. `None` means uncapped;
    /// the gauge still counts for observability.
    fn try_inc(&self, cap: Option<u32>) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| match cap {
                Some(c) if v >= i64::from(c) => None,
                _ => Some(v + 1),
            })
            .is_ok()
    }

    /// Unconditional decrement; a would-be negative value is clamped and
    /// logged, since it means a release without a matching reserve.
    fn dec(&self, what: &'static str) {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            self.0.fetch_add(1, Ordering::SeqCst);
            tracing::error!(gauge = what, "gauge released below zero");
        }
    }

    fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct WindowCell {
    events: Mutex<VecDeque<Instant>>,
}

fn trim(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = events.front() {
        if now.duration_since(*front) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}

/// Counter cells for one identity.
#[derive(Debug, Default)]
struct CellSet {
    unary: GaugeCell,
    sse: GaugeCell,
    window: WindowCell,
    /// Milliseconds since bank epoch; freshness for the idle sweep.
    last_access: AtomicU64,
}

/// Live totals for health and monitor endpoints.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BankSnapshot {
    pub active_unary: i64,
    pub active_sse: i64,
    pub requests_last_minute: usize,
    pub tracked_identities: usize,
    pub tracked_apis: usize,
}

struct BankShared {
    window: Duration,
    epoch: Instant,
    global: CellSet,
    identities: DashMap<String, Arc<CellSet>>,
    apis: DashMap<String, Arc<WindowCell>>,
    release_notify: Notify,
}

impl BankShared {
    fn millis_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn identity_cells(&self, identity: &str, now: Instant) -> Arc<CellSet> {
        let cells = self
            .identities
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(CellSet::default()))
            .clone();
        cells.last_access.store(self.millis_since_epoch(now), Ordering::Relaxed);
        cells
    }

    fn api_cells(&self, api: &str) -> Arc<WindowCell> {
        self.apis
            .entry(api.to_string())
            .or_insert_with(|| Arc::new(WindowCell::default()))
            .clone()
    }

    fn release(&self, cells: &CellSet, kind: TicketKind) {
        match kind {
            TicketKind::Unary => {
                cells.unary.dec("identity unary");
                self.global.unary.dec("global unary");
            }
            TicketKind::Sse => {
                cells.sse.dec("identity sse");
                self.global.sse.dec("global sse");
            }
        }
        self.release_notify.notify_one();
    }
}

/// Process-global admission counters. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CounterBank {
    shared: Arc<BankShared>,
}

impl CounterBank {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    /// Bank with a custom window length; production uses 60 seconds.
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            shared: Arc::new(BankShared {
                window,
                epoch: Instant::now(),
                global: CellSet::default(),
                identities: DashMap::new(),
                apis: DashMap::new(),
                release_notify: Notify::new(),
            }),
        }
    }

    /// Attempts to admit a request, atomically verifying every relevant cap
    /// and committing the increments when all of them hold.
    ///
    /// A unary admission commits one event into the shared rate windows; an
    /// SSE admission only occupies its connection gauges — its messages are
    /// accounted one by one through [`try_record_message`](Self::try_record_message).
    ///
    /// # Errors
    ///
    /// Returns the first violated cap, in evaluation order, with no state
    /// changed.
    pub fn try_reserve(
        &self,
        identity: &str,
        api: &str,
        kind: TicketKind,
        rules: &CheckRules,
    ) -> Result<Reservation, Deny> {
        let shared = &self.shared;
        let now = Instant::now();
        let cells = shared.identity_cells(identity, now);
        let api_cell = rules.api_rpm.map(|_| shared.api_cells(api));

        // Fixed lock order: identity window, api window, global window.
        let mut user_events = cells.window.events.lock();
        let mut api_events = api_cell.as_ref().map(|c| c.events.lock());
        let mut global_events = shared.global.window.events.lock();

        trim(&mut user_events, now, shared.window);
        if let Some(events) = api_events.as_mut() {
            trim(events, now, shared.window);
        }
        trim(&mut global_events, now, shared.window);

        if let Some(cap) = rules.user.max_requests_per_minute {
            if user_events.len() >= cap as usize {
                return Err(Deny::UserRate);
            }
        }
        if let (Some(cap), Some(events)) = (rules.api_rpm, api_events.as_ref()) {
            if events.len() >= cap as usize {
                return Err(Deny::ApiRate);
            }
        }
        if let Some(cap) = rules.global.max_requests_per_minute {
            if global_events.len() >= cap as usize {
                return Err(Deny::GlobalRate);
            }
        }

        match kind {
            TicketKind::Unary => {
                if !cells.unary.try_inc(rules.user.max_concurrent) {
                    return Err(Deny::UserConcurrency);
                }
                if !shared.global.unary.try_inc(rules.global.max_concurrent) {
                    cells.unary.dec("identity unary");
                    return Err(Deny::GlobalConcurrency);
                }
            }
            TicketKind::Sse => {
                if !cells.sse.try_inc(rules.user.max_sse_connections) {
                    return Err(Deny::UserSse);
                }
                if !shared.global.sse.try_inc(rules.global.max_sse_connections) {
                    cells.sse.dec("identity sse");
                    return Err(Deny::GlobalSse);
                }
            }
        }

        if kind == TicketKind::Unary {
            user_events.push_back(now);
            if let Some(events) = api_events.as_mut() {
                events.push_back(now);
            }
            global_events.push_back(now);
        }

        drop(user_events);
        drop(api_events);
        drop(global_events);

        Ok(Reservation { shared: Arc::clone(shared), cells, kind })
    }

    /// Accounts one forwarded SSE message against the shared rate windows:
    /// checks that the event would not breach any rpm cap, then commits it.
    ///
    /// # Errors
    ///
    /// Returns the first rpm cap the message would breach, with nothing
    /// committed.
    pub fn try_record_message(
        &self,
        identity: &str,
        api: &str,
        rules: &CheckRules,
    ) -> Result<(), Deny> {
        let shared = &self.shared;
        let now = Instant::now();
        let cells = shared.identity_cells(identity, now);
        let api_cell = rules.api_rpm.map(|_| shared.api_cells(api));

        let mut user_events = cells.window.events.lock();
        let mut api_events = api_cell.as_ref().map(|c| c.events.lock());
        let mut global_events = shared.global.window.events.lock();

        trim(&mut user_events, now, shared.window);
        if let Some(events) = api_events.as_mut() {
            trim(events, now, shared.window);
        }
        trim(&mut global_events, now, shared.window);

        if let Some(cap) = rules.user.max_requests_per_minute {
            if user_events.len() >= cap as usize {
                return Err(Deny::UserRate);
            }
        }
        if let (Some(cap), Some(events)) = (rules.api_rpm, api_events.as_ref()) {
            if events.len() >= cap as usize {
                return Err(Deny::ApiRate);
            }
        }
        if let Some(cap) = rules.global.max_requests_per_minute {
            if global_events.len() >= cap as usize {
                return Err(Deny::GlobalRate);
            }
        }

        user_events.push_back(now);
        if let Some(events) = api_events.as_mut() {
            events.push_back(now);
        }
        global_events.push_back(now);
        Ok(())
    }

    /// Resolves when a concurrency slot has been released since the last
    /// call. Notifications coalesce; the wait queue drains on each.
    pub async fn slot_released(&self) {
        self.shared.release_notify.notified().await;
    }

    /// Current identity window aggregate; test and monitor helper.
    #[must_use]
    pub fn identity_window_count(&self, identity: &str) -> usize {
        let now = Instant::now();
        let cells = self.shared.identity_cells(identity, now);
        let mut events = cells.window.events.lock();
        trim(&mut events, now, self.shared.window);
        events.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> BankSnapshot {
        let shared = &self.shared;
        let now = Instant::now();
        let requests_last_minute = {
            let mut events = shared.global.window.events.lock();
            trim(&mut events, now, shared.window);
            events.len()
        };
        BankSnapshot {
            active_unary: shared.global.unary.get(),
            active_sse: shared.global.sse.get(),
            requests_last_minute,
            tracked_identities: shared.identities.len(),
            tracked_apis: shared.apis.len(),
        }
    }

    /// Drops cells that have been idle for longer than the window. Cells
    /// with live gauges or unexpired window events always survive.
    pub fn sweep_idle(&self) -> usize {
        let shared = &self.shared;
        let now = Instant::now();
        let cutoff = shared
            .millis_since_epoch(now)
            .saturating_sub(u64::try_from(shared.window.as_millis()).unwrap_or(u64::MAX));
        let before = shared.identities.len() + shared.apis.len();

        shared.identities.retain(|_, cells| {
            if cells.unary.get() > 0 || cells.sse.get() > 0 {
                return true;
            }
            if cells.last_access.load(Ordering::Relaxed) > cutoff {
                return true;
            }
            let mut events = cells.window.events.lock();
            trim(&mut events, now, shared.window);
            !events.is_empty()
        });
        shared.apis.retain(|_, cell| {
            let mut events = cell.events.lock();
            trim(&mut events, now, shared.window);
            !events.is_empty()
        });

        before.saturating_sub(shared.identities.len() + shared.apis.len())
    }

    /// Background task that sweeps idle cells once per window.
    pub fn spawn_idle_sweeper(bank: Self) -> tokio::task::JoinHandle<()> {
        let period = bank.shared.window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = bank.sweep_idle();
                if removed > 0 {
                    tracing::debug!(removed, "swept idle counter cells");
                }
            }
        })
    }

    #[cfg(test)]
    fn tracks_identity(&self, identity: &str) -> bool {
        self.shared.identities.contains_key(identity)
    }
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII hold on one concurrency slot.
///
/// Dropping the reservation decrements its gauges exactly once and notifies
/// the wait queue, on every exit path: normal completion, client disconnect
/// (future drop), downstream error, or an abandoned queue hand-off.
pub struct Reservation {
    shared: Arc<BankShared>,
    cells: Arc<CellSet>,
    kind: TicketKind,
}

impl Reservation {
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.shared.release(&self.cells, self.kind);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("kind", &self.kind).finish()
    }
}
