//! Bounded priority wait queue for concurrency-blocked requests.
//!
//! Requests that fail admission on a concurrency cap (never on a rate cap)
//! park here until a slot frees. Ordering is (priority desc, arrival asc):
//! one `BTreeMap` keyed by `(rank, sequence)` gives both the head for
//! wake-ups and the tail for preemption.
//!
//! Each waiter communicates over its own one-shot channel and resolves
//! exactly once: the entry owns the sender, and every resolution path —
//! admission, rate denial at wake-up, preemption, deadline, cancellation —
//! removes the entry from the map under the queue lock before touching the
//! channel. Cancellation is a dropped [`EntryGuard`]; a deadline is enforced
//! by the waiter itself so a timed-out entry cannot also be admitted.
//!
//! A single dispatcher task drains the queue head whenever the counter bank
//! reports a released slot, re-evaluating caps against the policy snapshot
//! current at dispatch time, so a policy change that raises limits lets
//! waiters through.

use crate::{
    auth::api_key::Priority,
    limits::{pattern, CheckRules, CounterBank, Deny, Reservation, TicketKind},
    policy::{LimitRule, PolicyHandle, PolicySnapshot, QueuePolicy},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::oneshot;

/// What a waiter learns when its channel resolves.
#[derive(Debug)]
enum WaitOutcome {
    Admitted(Reservation),
    RateLimited(Deny),
    Preempted,
}

/// Terminal result of one queue stay.
#[derive(Debug)]
pub enum JoinOutcome {
    /// A slot was reserved for this waiter.
    Admitted(Reservation),
    /// A rate cap failed at wake-up time.
    RateLimited(Deny),
    /// The queue was full and held no lower-priority victim.
    Full,
    /// The deadline passed before a slot freed.
    Timeout,
    /// Evicted by a higher-priority arrival.
    Preempted,
}

/// What one parked request needs to be re-evaluated later.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub identity: String,
    pub api: String,
    pub kind: TicketKind,
    pub priority: Priority,
    pub limit_overrides: Option<LimitRule>,
}

struct Waiting {
    request: QueueRequest,
    tx: oneshot::Sender<WaitOutcome>,
}

type EntryKey = (u8, u64);

struct QueueInner {
    entries: Mutex<BTreeMap<EntryKey, Waiting>>,
    sequence: AtomicU64,
}

/// The shared wait queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<QueueInner>,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                entries: Mutex::new(BTreeMap::new()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Waiter counts by priority, for the monitor endpoint.
    #[must_use]
    pub fn depth_by_priority(&self) -> [usize; 3] {
        let entries = self.inner.entries.lock();
        let mut counts = [0usize; 3];
        for ((rank, _), _) in entries.iter() {
            counts[*rank as usize] += 1;
        }
        counts
    }

    /// Parks a request and waits for a slot, a deadline, or an eviction.
    ///
    /// The fast path has already failed on a concurrency cap when this is
    /// called. A dispatch pass runs immediately after insertion so a slot
    /// released between that failure and the insertion is not missed.
    pub async fn join(
        &self,
        bank: &CounterBank,
        policy: &PolicyHandle,
        request: QueueRequest,
        queue_policy: &QueuePolicy,
    ) -> JoinOutcome {
        let (mut rx, mut guard) = match self.enqueue(request, queue_policy.max_size) {
            Ok(pair) => pair,
            Err(QueueFull) => return JoinOutcome::Full,
        };

        self.dispatch(bank, &policy.load());

        match tokio::time::timeout(queue_policy.timeout_duration(), &mut rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                match outcome {
                    WaitOutcome::Admitted(reservation) => JoinOutcome::Admitted(reservation),
                    WaitOutcome::RateLimited(deny) => JoinOutcome::RateLimited(deny),
                    WaitOutcome::Preempted => JoinOutcome::Preempted,
                }
            }
            Ok(Err(_closed)) => {
                // The sender is dropped only together with its entry, so this
                // is unreachable; fail closed if it ever happens.
                guard.disarm();
                tracing::error!("queue entry channel closed without an outcome");
                JoinOutcome::Timeout
            }
            Err(_elapsed) => {
                if self.remove(guard.key) {
                    guard.disarm();
                    return JoinOutcome::Timeout;
                }
                // Lost the race: the entry was resolved while the timer
                // fired. The outcome is already in the channel.
                guard.disarm();
                match rx.try_recv() {
                    Ok(WaitOutcome::Admitted(reservation)) => JoinOutcome::Admitted(reservation),
                    Ok(WaitOutcome::RateLimited(deny)) => JoinOutcome::RateLimited(deny),
                    Ok(WaitOutcome::Preempted) => JoinOutcome::Preempted,
                    Err(_) => {
                        tracing::error!("resolved queue entry had no outcome");
                        JoinOutcome::Timeout
                    }
                }
            }
        }
    }

    fn enqueue(
        &self,
        request: QueueRequest,
        max_size: usize,
    ) -> Result<(oneshot::Receiver<WaitOutcome>, EntryGuard), QueueFull> {
        let mut entries = self.inner.entries.lock();

        if entries.len() >= max_size {
            let rank = request.priority.rank();
            let victim_key = entries.range((rank + 1, 0)..).next_back().map(|(key, _)| *key);
            match victim_key {
                Some(key) => {
                    let victim = entries.remove(&key).expect("victim key was just observed");
                    let _ = victim.tx.send(WaitOutcome::Preempted);
                    tracing::debug!(
                        evicted_identity = %victim.request.identity,
                        "queue entry preempted by higher-priority arrival"
                    );
                }
                None => return Err(QueueFull),
            }
        }

        let key =
            (request.priority.rank(), self.inner.sequence.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        entries.insert(key, Waiting { request, tx });

        Ok((rx, EntryGuard { queue: self.clone(), key, armed: true }))
    }

    fn remove(&self, key: EntryKey) -> bool {
        self.inner.entries.lock().remove(&key).is_some()
    }

    /// Drains admissible waiters from the head of the queue.
    ///
    /// The head is re-evaluated against current caps: a successful
    /// reservation resolves it admitted; a rate-cap failure resolves it
    /// rate-limited and moves on; a concurrency-cap failure means the slot
    /// is still occupied, so the head keeps waiting.
    pub fn dispatch(&self, bank: &CounterBank, snapshot: &PolicySnapshot) {
        let mut entries = self.inner.entries.lock();

        loop {
            let Some((&key, head)) = entries.iter().next() else { break };

            let rules = CheckRules {
                user: head
                    .request
                    .limit_overrides
                    .unwrap_or(snapshot.rate_limit.default_user),
                api_rpm: pattern::rule_for_identifier(&snapshot.rate_limit, &head.request.api)
                    .and_then(|r| r.max_requests_per_minute),
                global: snapshot.rate_limit.global_limit,
            };

            match bank.try_reserve(&head.request.identity, &head.request.api, head.request.kind, &rules)
            {
                Ok(reservation) => {
                    let entry = entries.remove(&key).expect("head key was just observed");
                    // A failed send means the waiter cancelled; the
                    // reservation drops here and releases its slot.
                    let _ = entry.tx.send(WaitOutcome::Admitted(reservation));
                }
                Err(deny) if deny.is_rate() => {
                    let entry = entries.remove(&key).expect("head key was just observed");
                    let _ = entry.tx.send(WaitOutcome::RateLimited(deny));
                }
                Err(_) => break,
            }
        }
    }

    /// Runs the dispatcher: one pass per released slot, against the policy
    /// snapshot current at that moment.
    pub fn spawn_dispatcher(
        queue: Self,
        bank: CounterBank,
        policy: Arc<PolicyHandle>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                bank.slot_released().await;
                queue.dispatch(&bank, &policy.load());
            }
        })
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct QueueFull;

/// Removes the waiter's entry when the waiting future is dropped.
struct EntryGuard {
    queue: WaitQueue,
    key: EntryKey,
    armed: bool,
}

impl EntryGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if self.armed {
            self.queue.remove(self.key);
        }
    }
}
