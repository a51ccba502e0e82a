//! Persistent, deduplicated, priority-ordered frontier of pending work.
//!
//! The frontier is the sole writer to the record store. Workers interact
//! only through `admit` / `next_where` / `complete` / `fail`; the in-memory
//! priority index is a mirror rebuilt from the store at startup.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::{CrawlConfig, FrontierConfig};
use crate::fingerprint::Fingerprint;
use crate::metrics::Metrics;
use crate::store::{FrontierRecord, ItemState, RecordStore, StateCounts, StoreError};

/// One unit of work handed to a worker by `next_where`.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: String,
    pub payload: String,
    pub priority: f64,
    pub attempts: u32,
    pub enqueued_at: u64,
}

impl WorkItem {
    fn from_record(record: &FrontierRecord) -> Self {
        Self {
            key: record.key.clone(),
            payload: record.payload.clone(),
            priority: record.priority,
            attempts: record.attempts,
            enqueued_at: record.enqueued_at,
        }
    }
}

/// Eligibility filter supplied per `next_where` call, typically backed by
/// the politeness governor. `eligible` may be called for several candidates;
/// `committed` fires at most once, after the InFlight transition persists,
/// still under the frontier lock so dispatch accounting is serialized.
pub trait DispatchGate {
    fn eligible(&self, payload: &str) -> bool;
    fn committed(&self, _payload: &str) {}
}

/// Gate that accepts everything; used by `next()`.
pub struct AlwaysEligible;

impl DispatchGate for AlwaysEligible {
    fn eligible(&self, _payload: &str) -> bool {
        true
    }
}

/// Max-heap entry: higher priority first, lower admission seq breaks ties.
#[derive(Debug, Clone)]
struct HeapEntry {
    priority: f64,
    seq: u64,
    key: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

struct FrontierInner {
    /// Full mirror of the store: every key ever admitted, with current state.
    records: HashMap<String, FrontierRecord>,
    /// Priority index over Pending keys. Entries can go stale (a retry pushes
    /// a fresh entry with the decayed priority); stale ones are dropped
    /// lazily when popped.
    heap: BinaryHeap<HeapEntry>,
    /// Claim times for InFlight keys, checked against the lease timeout.
    leases: HashMap<String, Instant>,
    pending: usize,
    in_flight: usize,
    done: usize,
    failed: usize,
    next_seq: u64,
    admissions_closed: bool,
}

/// Frontier statistics snapshot for progress reporting.
#[derive(Debug, Clone, Copy)]
pub struct FrontierStats {
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl std::fmt::Display for FrontierStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frontier: {} pending, {} in-flight, {} done, {} failed",
            self.pending, self.in_flight, self.done, self.failed
        )
    }
}

pub struct Frontier {
    store: Arc<RecordStore>,
    fingerprint: Arc<dyn Fingerprint>,
    config: FrontierConfig,
    metrics: Arc<Metrics>,
    inner: Mutex<FrontierInner>,
}

impl Frontier {
    /// Rebuild the frontier from whatever the store holds. Any InFlight
    /// record is crashed work from a previous run and is reset to Pending
    /// (persisted), so no work is silently lost; execution is therefore
    /// at-least-once, not exactly-once.
    pub fn open(
        store: Arc<RecordStore>,
        fingerprint: Arc<dyn Fingerprint>,
        config: FrontierConfig,
    ) -> Result<Self, StoreError> {
        let mut inner = FrontierInner {
            records: HashMap::new(),
            heap: BinaryHeap::new(),
            leases: HashMap::new(),
            pending: 0,
            in_flight: 0,
            done: 0,
            failed: 0,
            next_seq: 0,
            admissions_closed: false,
        };

        let mut recovered = 0usize;
        for mut record in store.scan()? {
            if record.seq >= inner.next_seq {
                inner.next_seq = record.seq + 1;
            }

            match record.state {
                ItemState::InFlight => {
                    record.state = ItemState::Pending;
                    store.put(&record)?;
                    recovered += 1;
                    inner.pending += 1;
                    inner.heap.push(HeapEntry {
                        priority: record.priority,
                        seq: record.seq,
                        key: record.key.clone(),
                    });
                }
                ItemState::Pending => {
                    inner.pending += 1;
                    inner.heap.push(HeapEntry {
                        priority: record.priority,
                        seq: record.seq,
                        key: record.key.clone(),
                    });
                }
                ItemState::Done => inner.done += 1,
                ItemState::Failed => inner.failed += 1,
            }

            inner.records.insert(record.key.clone(), record);
        }

        if recovered > 0 {
            tracing::info!(recovered, "reset crashed in-flight records to pending");
        }
        tracing::info!(
            pending = inner.pending,
            done = inner.done,
            failed = inner.failed,
            "frontier rebuilt from record store"
        );

        Ok(Self {
            store,
            fingerprint,
            config,
            metrics: Arc::new(Metrics::new()),
            inner: Mutex::new(inner),
        })
    }

    /// Open according to the run config: a fresh start wipes the store and
    /// admits the seed list; a resume rebuilds from the store as-is.
    pub fn bootstrap(
        store: Arc<RecordStore>,
        fingerprint: Arc<dyn Fingerprint>,
        config: FrontierConfig,
        crawl: &CrawlConfig,
    ) -> Result<Self, StoreError> {
        if !crawl.resume {
            store.reset()?;
        }

        let frontier = Self::open(store, fingerprint, config)?;

        if !crawl.resume {
            let mut seeded = 0usize;
            for (payload, priority) in &crawl.seeds {
                if frontier.admit(payload, *priority)? {
                    seeded += 1;
                }
            }
            tracing::info!(seeded, "seeded fresh frontier");
        }

        Ok(frontier)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Admit a payload. Returns `Ok(false)` without touching anything when
    /// the key was already seen in any state (the dedup guarantee) or when
    /// admissions are closed for drain.
    pub fn admit(&self, payload: &str, priority: f64) -> Result<bool, StoreError> {
        let key = self.fingerprint.key(payload);
        let mut inner = self.inner.lock();

        if inner.admissions_closed {
            tracing::debug!(key, "admission rejected: frontier draining");
            return Ok(false);
        }

        if inner.records.contains_key(&key) {
            self.metrics.duplicates.inc();
            return Ok(false);
        }

        let record = FrontierRecord::new(key.clone(), payload.to_string(), priority, inner.next_seq);

        // Persist before mutating memory so a storage failure leaves the
        // in-memory index untouched.
        self.store.put(&record)?;

        inner.next_seq += 1;
        inner.heap.push(HeapEntry {
            priority: record.priority,
            seq: record.seq,
            key: key.clone(),
        });
        inner.records.insert(key, record);
        inner.pending += 1;
        self.metrics.admitted.inc();
        Ok(true)
    }

    /// Pop the highest-priority Pending item (stable FIFO among equal
    /// priorities), transition it to InFlight, and return it. `Ok(None)`
    /// means nothing is pending or eligible - a drain signal, not an error.
    pub fn next(&self) -> Result<Option<WorkItem>, StoreError> {
        self.next_where(&AlwaysEligible)
    }

    /// `next()` with an eligibility gate. Ineligible entries are skipped,
    /// not removed, and restored afterward, so one throttled target never
    /// blocks eligible work on others.
    pub fn next_where(&self, gate: &dyn DispatchGate) -> Result<Option<WorkItem>, StoreError> {
        let mut inner = self.inner.lock();

        self.reap_expired_locked(&mut inner)?;

        let mut skipped: Vec<HeapEntry> = Vec::new();
        let mut picked: Option<(HeapEntry, FrontierRecord)> = None;

        while let Some(entry) = inner.heap.pop() {
            let record = match inner.records.get(&entry.key) {
                Some(r) => r,
                None => continue,
            };
            // Stale entry: state moved on, or a retry superseded the
            // priority this entry was pushed with.
            if record.state != ItemState::Pending || record.priority != entry.priority {
                continue;
            }
            if !gate.eligible(&record.payload) {
                skipped.push(entry);
                continue;
            }
            picked = Some((entry, record.clone()));
            break;
        }

        for entry in skipped {
            inner.heap.push(entry);
        }

        let Some((entry, mut record)) = picked else {
            return Ok(None);
        };

        record.state = ItemState::InFlight;
        match self.store.put(&record) {
            Ok(()) => {}
            Err(e) => {
                // Roll back: the item stays Pending in memory and in the store.
                inner.heap.push(entry);
                return Err(e);
            }
        }

        let item = WorkItem::from_record(&record);
        inner.leases.insert(record.key.clone(), Instant::now());
        inner.records.insert(record.key.clone(), record);
        inner.pending -= 1;
        inner.in_flight += 1;
        self.metrics.dispatched.inc();
        gate.committed(&item.payload);
        Ok(Some(item))
    }

    /// Transition InFlight -> Done. Idempotent: duplicate completions log a
    /// consistency warning and succeed, since duplicate signals are expected
    /// under retried network calls.
    pub fn complete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        let record = match inner.records.get(key) {
            Some(r) => r.clone(),
            None => {
                tracing::warn!(key, "completion for unknown key, ignoring");
                return Ok(());
            }
        };

        match record.state {
            ItemState::InFlight => {
                let mut updated = record;
                updated.state = ItemState::Done;
                self.store.put(&updated)?;
                inner.records.insert(key.to_string(), updated);
                inner.leases.remove(key);
                inner.in_flight -= 1;
                inner.done += 1;
                self.metrics.completed.inc();
                Ok(())
            }
            ItemState::Done => {
                tracing::warn!(key, "duplicate completion, record already done");
                Ok(())
            }
            ItemState::Pending => {
                // The lease expired and the item was requeued, but the
                // original worker finished after all. Count the work.
                tracing::warn!(key, "late completion after lease expiry, marking done");
                let mut updated = record;
                updated.state = ItemState::Done;
                self.store.put(&updated)?;
                inner.records.insert(key.to_string(), updated);
                inner.pending -= 1;
                inner.done += 1;
                self.metrics.completed.inc();
                Ok(())
            }
            ItemState::Failed => {
                tracing::warn!(key, "completion for terminally failed record, ignoring");
                Ok(())
            }
        }
    }

    /// Report a processing failure. Retryable failures below `max_attempts`
    /// requeue the item as Pending with its priority decayed; anything else
    /// is terminal Failed. Increments `attempts` either way.
    pub fn fail(&self, key: &str, retryable: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        let record = match inner.records.get(key) {
            Some(r) => r.clone(),
            None => {
                tracing::warn!(key, "failure report for unknown key, ignoring");
                return Ok(());
            }
        };

        if record.state != ItemState::InFlight {
            tracing::warn!(key, state = ?record.state, "failure report for item not in flight, ignoring");
            return Ok(());
        }

        let mut updated = record;
        updated.attempts += 1;

        if retryable && updated.attempts < self.config.max_attempts {
            updated.priority *= self.config.retry_decay;
            updated.state = ItemState::Pending;
            self.store.put(&updated)?;

            inner.heap.push(HeapEntry {
                priority: updated.priority,
                seq: updated.seq,
                key: key.to_string(),
            });
            tracing::debug!(
                key,
                attempts = updated.attempts,
                priority = updated.priority,
                "requeued with decayed priority"
            );
            inner.records.insert(key.to_string(), updated);
            inner.leases.remove(key);
            inner.in_flight -= 1;
            inner.pending += 1;
            self.metrics.retried.inc();
        } else {
            updated.state = ItemState::Failed;
            self.store.put(&updated)?;

            tracing::warn!(key, attempts = updated.attempts, retryable, "terminally failed");
            inner.records.insert(key.to_string(), updated);
            inner.leases.remove(key);
            inner.in_flight -= 1;
            inner.failed += 1;
            self.metrics.failed.inc();
        }

        Ok(())
    }

    /// Requeue InFlight items whose lease exceeded the timeout. Also runs
    /// inline at the start of every `next_where`.
    pub fn reap_expired(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        self.reap_expired_locked(&mut inner)
    }

    fn reap_expired_locked(&self, inner: &mut FrontierInner) -> Result<usize, StoreError> {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .leases
            .iter()
            .filter(|(_, claimed_at)| now.duration_since(**claimed_at) >= self.config.lease_timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut reclaimed = 0usize;
        for key in expired {
            let record = match inner.records.get(&key) {
                Some(r) if r.state == ItemState::InFlight => r.clone(),
                _ => {
                    inner.leases.remove(&key);
                    continue;
                }
            };

            let mut updated = record;
            updated.state = ItemState::Pending;
            // On storage error the lease stays; the next reap retries it.
            self.store.put(&updated)?;

            inner.heap.push(HeapEntry {
                priority: updated.priority,
                seq: updated.seq,
                key: key.clone(),
            });
            inner.records.insert(key.clone(), updated);
            inner.leases.remove(&key);
            inner.in_flight -= 1;
            inner.pending += 1;
            reclaimed += 1;
            self.metrics.lease_expired.inc();
            tracing::warn!(key, "lease expired, requeued");
        }

        Ok(reclaimed)
    }

    /// Stop accepting new admissions; part of drain-aware shutdown.
    pub fn close_admissions(&self) {
        let mut inner = self.inner.lock();
        inner.admissions_closed = true;
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending == 0 && inner.in_flight == 0
    }

    pub fn counts(&self) -> StateCounts {
        let inner = self.inner.lock();
        StateCounts {
            pending: inner.pending,
            in_flight: inner.in_flight,
            done: inner.done,
            failed: inner.failed,
        }
    }

    pub fn stats(&self) -> FrontierStats {
        let inner = self.inner.lock();
        FrontierStats {
            pending: inner.pending,
            in_flight: inner.in_flight,
            done: inner.done,
            failed: inner.failed,
        }
    }
}

/// Background reaper: periodically requeues expired leases so stalled work
/// resurfaces even when no worker is polling.
pub async fn reaper_task(
    frontier: Arc<Frontier>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match frontier.reap_expired() {
                    Ok(0) => {}
                    Ok(reclaimed) => tracing::info!(reclaimed, "reaper requeued expired leases"),
                    Err(e) => tracing::error!(error = %e, "reaper storage error"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
