//! Concurrency-safe metrics aggregation for a load test run.
//!
//! [`Metrics`] sits on the hot path of every workload operation, so all
//! counters are lock-free atomics. Error categories are split in two:
//!
//! - well-known categories ([`ErrorCategory`]) live in a fixed array and are
//!   incremented without any lock;
//! - novel, free-form labels go through a double-checked insert on a
//!   read-mostly map. The common case (label already present) only takes the
//!   shared read lock and performs an atomic add under it.
//!
//! All counter operations use `SeqCst` ordering.
//!
//! # Read-only transition
//!
//! Once every worker has joined, the driver calls [`Metrics::seal`]. Writers
//! announce themselves in an in-flight counter before checking the sealed
//! flag, and `seal` sets the flag before waiting for the in-flight counter to
//! drain. Under sequential consistency either the writer observes the flag
//! (and discards its write) or `seal` observes the writer (and waits for it),
//! so no write can land in a snapshot taken after sealing.

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

const ORDER: Ordering = Ordering::SeqCst;

/// Number of well-known error categories.
const CATEGORY_COUNT: usize = 8;

/// Number of log2 latency buckets (bucket `i` holds samples below `2^i` µs).
const LATENCY_BUCKETS: usize = 40;

/// Well-known error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Timeout,
    ConstraintViolation,
    SerializationFailure,
    Deadlock,
    Query,
    PoolExhausted,
    Other,
}

impl ErrorCategory {
    /// Every well-known category, in counter-array order.
    pub const ALL: [ErrorCategory; CATEGORY_COUNT] = [
        ErrorCategory::Connection,
        ErrorCategory::Timeout,
        ErrorCategory::ConstraintViolation,
        ErrorCategory::SerializationFailure,
        ErrorCategory::Deadlock,
        ErrorCategory::Query,
        ErrorCategory::PoolExhausted,
        ErrorCategory::Other,
    ];

    /// Label used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ConstraintViolation => "constraint_violation",
            ErrorCategory::SerializationFailure => "serialization_failure",
            ErrorCategory::Deadlock => "deadlock",
            ErrorCategory::Query => "query",
            ErrorCategory::PoolExhausted => "pool_exhausted",
            ErrorCategory::Other => "other",
        }
    }

    /// Resolve a label to a well-known category.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == label)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Classify a PostgreSQL error by its SQLSTATE.
    pub fn classify(err: &tokio_postgres::Error) -> Self {
        match err.code() {
            Some(state) => Self::classify_sqlstate(state.code()),
            None if err.is_closed() => ErrorCategory::Connection,
            None => ErrorCategory::Other,
        }
    }

    /// Classify a raw five-character SQLSTATE code.
    pub fn classify_sqlstate(code: &str) -> Self {
        match code {
            "40001" => ErrorCategory::SerializationFailure,
            "40P01" => ErrorCategory::Deadlock,
            "57014" | "55P03" => ErrorCategory::Timeout,
            "53300" => ErrorCategory::Connection,
            c if c.starts_with("23") => ErrorCategory::ConstraintViolation,
            c if c.starts_with("08") => ErrorCategory::Connection,
            c if c.starts_with("57P") => ErrorCategory::Connection,
            _ => ErrorCategory::Query,
        }
    }

    /// Classify a failed pool checkout.
    pub fn classify_pool(err: &deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Timeout(_) => ErrorCategory::PoolExhausted,
            deadpool_postgres::PoolError::Backend(e) if e.code().is_some() => Self::classify(e),
            _ => ErrorCategory::Connection,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free latency histogram with log2 microsecond buckets.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }

    fn bucket_for(micros: u64) -> usize {
        let bits = (u64::BITS - micros.leading_zeros()) as usize;
        bits.min(LATENCY_BUCKETS - 1)
    }

    fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.min_micros.fetch_min(micros, ORDER);
        self.max_micros.fetch_max(micros, ORDER);
        // Saturate so a pathological latency cannot wrap the mean.
        let _ = self
            .sum_micros
            .fetch_update(ORDER, ORDER, |sum| Some(sum.saturating_add(micros)));
        self.buckets[Self::bucket_for(micros)].fetch_add(1, ORDER);
    }

    fn summary(&self) -> Option<LatencySummary> {
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(ORDER)).collect();
        let count: u64 = counts.iter().sum();
        if count == 0 {
            return None;
        }
        let min_us = self.min_micros.load(ORDER);
        let max_us = self.max_micros.load(ORDER);
        let percentile = |p: f64| -> u64 {
            let target = ((count as f64) * p).ceil().max(1.0) as u64;
            let mut seen = 0u64;
            for (i, c) in counts.iter().enumerate() {
                seen += c;
                if seen >= target {
                    // Upper bound of bucket i, clamped to what was observed.
                    let upper = if i == 0 { 0 } else { (1u64 << i) - 1 };
                    return upper.max(min_us).min(max_us);
                }
            }
            max_us
        };
        Some(LatencySummary {
            count,
            mean_us: self.sum_micros.load(ORDER) / count,
            min_us,
            max_us,
            p50_us: percentile(0.50),
            p95_us: percentile(0.95),
            p99_us: percentile(0.99),
        })
    }
}

/// Latency distribution of successful operations, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    /// Percentiles are bucket upper bounds (within a factor of two).
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Shared metrics sink written by every worker during a run.
#[derive(Debug)]
pub struct Metrics {
    completed: AtomicU64,
    errors: AtomicU64,
    known: [AtomicU64; CATEGORY_COUNT],
    custom: RwLock<HashMap<String, AtomicU64>>,
    latency: LatencyHistogram,
    sealed: AtomicBool,
    in_flight: AtomicU64,
    late_writes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight writer count on drop.
struct WriteGuard<'a>(&'a AtomicU64);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, ORDER);
    }
}

impl Metrics {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            known: std::array::from_fn(|_| AtomicU64::new(0)),
            custom: RwLock::new(HashMap::new()),
            latency: LatencyHistogram::new(),
            sealed: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            late_writes: AtomicU64::new(0),
        }
    }

    /// Admit a writer, or return `None` if the aggregator is read-only.
    fn begin_write(&self) -> Option<WriteGuard<'_>> {
        self.in_flight.fetch_add(1, ORDER);
        let guard = WriteGuard(&self.in_flight);
        if self.sealed.load(ORDER) {
            drop(guard);
            if self.late_writes.fetch_add(1, ORDER) == 0 {
                warn!("Metrics write after the run was sealed; discarding");
            }
            return None;
        }
        Some(guard)
    }

    /// Record one completed operation.
    pub fn record_success(&self) {
        if let Some(_guard) = self.begin_write() {
            self.completed.fetch_add(1, ORDER);
        }
    }

    /// Record one completed operation together with its latency.
    pub fn record_success_with_latency(&self, latency: Duration) {
        if let Some(_guard) = self.begin_write() {
            self.latency.record(latency);
            self.completed.fetch_add(1, ORDER);
        }
    }

    /// Record `n` completed operations at once (e.g. a batch).
    pub fn record_successes(&self, n: u64) {
        if let Some(_guard) = self.begin_write() {
            self.completed.fetch_add(n, ORDER);
        }
    }

    /// Record one failed operation under a well-known category.
    pub fn record_error_category(&self, category: ErrorCategory) {
        if let Some(_guard) = self.begin_write() {
            self.known[category.index()].fetch_add(1, ORDER);
            self.errors.fetch_add(1, ORDER);
        }
    }

    /// Record one failed operation under a free-form category label.
    pub fn record_error(&self, label: &str) {
        if let Some(category) = ErrorCategory::from_label(label) {
            self.record_error_category(category);
            return;
        }
        let Some(_guard) = self.begin_write() else {
            return;
        };
        {
            let map = self.custom.read();
            if let Some(counter) = map.get(label) {
                counter.fetch_add(1, ORDER);
                self.errors.fetch_add(1, ORDER);
                return;
            }
        }
        // First use of this label: re-check under the write lock so two
        // workers racing on the same new label share one entry.
        let mut map = self.custom.write();
        map.entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, ORDER);
        self.errors.fetch_add(1, ORDER);
    }

    /// Record a PostgreSQL error, classified by SQLSTATE.
    pub fn record_pg_error(&self, err: &tokio_postgres::Error) {
        self.record_error_category(ErrorCategory::classify(err));
    }

    /// Record a failed pool checkout.
    pub fn record_pool_error(&self, err: &deadpool_postgres::PoolError) {
        self.record_error_category(ErrorCategory::classify_pool(err));
    }

    /// Completed operations so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(ORDER)
    }

    /// Errors so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(ORDER)
    }

    /// Whether the aggregator has been made read-only.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(ORDER)
    }

    /// Make the aggregator read-only and wait for admitted writers to finish.
    pub fn seal(&self) {
        self.sealed.store(true, ORDER);
        while self.in_flight.load(ORDER) != 0 {
            std::thread::yield_now();
        }
    }

    /// Take a snapshot. Throughput is derived from `elapsed`, the whole run's
    /// wall-clock time, never from any single worker.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let mut error_types = BTreeMap::new();
        for category in ErrorCategory::ALL {
            let count = self.known[category.index()].load(ORDER);
            if count > 0 {
                error_types.insert(category.as_str().to_string(), count);
            }
        }
        for (label, counter) in self.custom.read().iter() {
            error_types.insert(label.clone(), counter.load(ORDER));
        }
        MetricsSnapshot {
            completed: self.completed.load(ORDER),
            errors: self.errors.load(ORDER),
            error_types,
            elapsed,
            latency: self.latency.summary(),
            late_writes: self.late_writes.load(ORDER),
        }
    }

    /// Seal the aggregator and take the final snapshot.
    pub fn finish(&self, elapsed: Duration) -> MetricsSnapshot {
        self.seal();
        self.snapshot(elapsed)
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Read-only view of a run's metrics, handed to the reporting layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Completed operations.
    pub completed: u64,
    /// Failed operations.
    pub errors: u64,
    /// Failed operations by category.
    pub error_types: BTreeMap<String, u64>,
    /// Wall-clock time of the run.
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Latency distribution, if the workload reported latencies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
    /// Writes discarded because they arrived after sealing.
    pub late_writes: u64,
}

impl MetricsSnapshot {
    /// Completed operations per second over the whole run.
    pub fn throughput(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.completed as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Fraction of attempted operations that failed.
    pub fn error_rate(&self) -> f64 {
        let total = self.completed + self.errors;
        if total > 0 {
            self.errors as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Count for one category label (0 if never seen).
    pub fn error_count(&self, label: &str) -> u64 {
        self.error_types.get(label).copied().unwrap_or(0)
    }
}
