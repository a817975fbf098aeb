use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hdrhistogram::Histogram;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::report::{Report, SecondStats};

/// Tracked latency range in microseconds.
const HIST_MIN_US: u64 = 1;
const HIST_MAX_US: u64 = 30_000_000;
const HIST_SIGFIGS: u8 = 3;

/// Ring capacity of the per-second time series.
const RING_SECONDS: usize = 300;

/// Bound on distinct error keys before new ones fold into `"other"`.
const MAX_ERROR_KEYS: usize = 100;

/// Sentinel status for transport errors classified as timeouts.
pub const STATUS_TIMEOUT: u16 = 1;

static RE_CONN_TUPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+->\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+")
        .expect("connection tuple pattern is valid")
});
static RE_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+").expect("address pattern is valid")
});

/// Replace ephemeral IP:PORT substrings with stable placeholders so one
/// flapping peer cannot mint a new error key per connection attempt.
pub fn sanitize_error(message: &str) -> String {
    let message = RE_CONN_TUPLE.replace_all(message, "[CONN_TUPLE]");
    RE_ADDR.replace_all(&message, "[IP]:[PORT]").into_owned()
}

/// Outcome of a single HTTP request within a scenario iteration.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub started: Instant,
    pub latency: Duration,
    /// HTTP status; 0 when no response was received.
    pub status: u16,
    pub bytes: u64,
    /// Transport error, if the request never produced a response.
    pub error: Option<String>,
    /// Whether the transport error was a network or OS level timeout.
    pub timed_out: bool,
    pub assertion_error: Option<String>,
    pub step_name: String,
    /// Negotiated protocol, e.g. "HTTP/1.1" or "HTTP/2.0".
    pub protocol: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(HIST_MIN_US, HIST_MAX_US, HIST_SIGFIGS)
        .expect("histogram bounds are valid")
}

/// Latency quantiles read from a histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub min: Duration,
    pub p50: Duration,
    pub p75: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySnapshot {
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        let us = Duration::from_micros;
        Self {
            min: us(hist.min()),
            p50: us(hist.value_at_quantile(0.50)),
            p75: us(hist.value_at_quantile(0.75)),
            p90: us(hist.value_at_quantile(0.90)),
            p95: us(hist.value_at_quantile(0.95)),
            p99: us(hist.value_at_quantile(0.99)),
            max: us(hist.max()),
        }
    }
}

/// Two histograms behind an atomic index bit.
///
/// `record` takes a short lock around a single value write into the active
/// buffer. `snapshot` flips the index, merges the retired buffer into the
/// cumulative histogram, resets the retired buffer, and reads quantiles from
/// the cumulative copy outside the record lock. Recording and quantile
/// computation therefore never contend on the same mutex.
#[derive(Debug)]
struct DoubleHistogram {
    active: AtomicUsize,
    buffers: [Mutex<Histogram<u64>>; 2],
    cumulative: Mutex<Histogram<u64>>,
}

impl DoubleHistogram {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            buffers: [Mutex::new(new_histogram()), Mutex::new(new_histogram())],
            cumulative: Mutex::new(new_histogram()),
        }
    }

    fn record(&self, value_us: u64) {
        let index = self.active.load(Ordering::Acquire);
        let mut hist = lock(&self.buffers[index]);
        hist.saturating_record(value_us.max(HIST_MIN_US));
    }

    fn snapshot(&self) -> LatencySnapshot {
        let retired = self.active.fetch_xor(1, Ordering::AcqRel);
        let mut cumulative = lock(&self.cumulative);
        {
            let mut buffer = lock(&self.buffers[retired]);
            let _ = cumulative.add(&*buffer);
            buffer.reset();
        }
        LatencySnapshot::from_histogram(&cumulative)
    }

    fn reset(&self) {
        lock(&self.buffers[0]).reset();
        lock(&self.buffers[1]).reset();
        lock(&self.cumulative).reset();
        self.active.store(0, Ordering::Release);
    }
}

/// One slot of the per-second ring.
#[derive(Debug)]
struct SecondBucket {
    /// Absolute test second this slot currently represents.
    second: AtomicU64,
    requests: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
    total_latency_us: AtomicU64,
    total_bytes: AtomicU64,
    status_codes: DashMap<u16, AtomicU64>,
    histogram: DoubleHistogram,
    reset_lock: Mutex<()>,
}

impl SecondBucket {
    fn new(second: u64) -> Self {
        Self {
            second: AtomicU64::new(second),
            requests: AtomicU64::new(0),
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            status_codes: DashMap::new(),
            histogram: DoubleHistogram::new(),
            reset_lock: Mutex::new(()),
        }
    }

    fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.fail.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.status_codes.clear();
        self.histogram.reset();
    }
}

/// Real-time metrics collector.
///
/// Results arrive on a single consumer task calling [`Monitor::add`];
/// [`Monitor::snapshot`] runs on a different task. Totals are atomics,
/// multisets are concurrent maps of atomic counters, and latency goes through
/// the double-buffered histogram.
#[derive(Debug)]
pub struct Monitor {
    start: Instant,
    requests: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
    assertion_failures: AtomicU64,
    total_bytes: AtomicU64,
    status_codes: DashMap<u16, AtomicU64>,
    errors: DashMap<String, AtomicU64>,
    assertion_errors: DashMap<String, AtomicU64>,
    protocols: DashMap<String, AtomicU64>,
    histogram: DoubleHistogram,
    ring: Vec<SecondBucket>,
    max_second: AtomicU64,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            requests: AtomicU64::new(0),
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            assertion_failures: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            status_codes: DashMap::new(),
            errors: DashMap::new(),
            assertion_errors: DashMap::new(),
            protocols: DashMap::new(),
            histogram: DoubleHistogram::new(),
            // Slot i starts out representing second i, so the first epoch
            // needs no reset at all.
            ring: (0..RING_SECONDS as u64).map(SecondBucket::new).collect(),
            max_second: AtomicU64::new(0),
        }
    }

    /// Record a single result. `http_success` reflects the configured success
    /// code set and the absence of a transport error; an assertion error
    /// downgrades the result to a failure here.
    pub fn add(&self, result: &RequestResult, http_success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(result.bytes, Ordering::Relaxed);

        let has_assertion_error = if let Some(failure) = &result.assertion_error {
            self.assertion_failures.fetch_add(1, Ordering::Relaxed);
            bump_capped(&self.assertion_errors, failure.clone());
            true
        } else {
            false
        };

        let is_success = http_success && !has_assertion_error;
        if is_success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fail.fetch_add(1, Ordering::Relaxed);
        }

        // A request that produced no response but failed on a recognised
        // timeout gets the sentinel status so the status breakdown separates
        // timeouts from other transport errors.
        let mut status = result.status;
        if status == 0 && result.error.is_some() && result.timed_out {
            status = STATUS_TIMEOUT;
        }
        bump(&self.status_codes, status);

        if let Some(error) = &result.error {
            bump_capped(&self.errors, sanitize_error(error));
        }
        if let Some(protocol) = &result.protocol {
            bump(&self.protocols, protocol.clone());
        }

        // Immediate transport failures have near-zero latency and would
        // distort the minimum, so only responses are recorded.
        let latency_us = result.latency.as_micros().min(u64::MAX as u128) as u64;
        if result.error.is_none() {
            self.histogram.record(latency_us);
        }

        let second = result
            .started
            .saturating_duration_since(self.start)
            .as_secs();
        self.max_second.fetch_max(second, Ordering::Relaxed);
        if let Some(bucket) = self.bucket_for(second) {
            bucket.requests.fetch_add(1, Ordering::Relaxed);
            bucket.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
            bucket.total_bytes.fetch_add(result.bytes, Ordering::Relaxed);
            if is_success {
                bucket.success.fetch_add(1, Ordering::Relaxed);
            } else {
                bucket.fail.fetch_add(1, Ordering::Relaxed);
            }
            bump(&bucket.status_codes, status);
            if result.error.is_none() {
                bucket.histogram.record(latency_us);
            }
        }
    }

    /// Locate the ring slot for an absolute second, resetting it first when
    /// the ring has wrapped into a new epoch. The reset happens under a
    /// per-slot lock held for one slot at a time. Returns `None` for results
    /// so stale their slot has already moved on.
    fn bucket_for(&self, second: u64) -> Option<&SecondBucket> {
        let slot = &self.ring[(second % RING_SECONDS as u64) as usize];
        if slot.second.load(Ordering::Acquire) != second {
            let _guard = lock(&slot.reset_lock);
            let current = slot.second.load(Ordering::Acquire);
            if current < second {
                slot.reset();
                slot.second.store(second, Ordering::Release);
            } else if current > second {
                return None;
            }
        }
        Some(slot)
    }

    /// Current counters for circuit breaker checks.
    pub fn get_stats(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.fail.load(Ordering::Relaxed),
            self.assertion_failures.load(Ordering::Relaxed),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Produce a report from the current state. All maps and the time series
    /// are fresh copies owned by the caller.
    pub fn snapshot(&self) -> Report {
        let success = self.success.load(Ordering::Relaxed);
        let fail = self.fail.load(Ordering::Relaxed);
        // Derived rather than read from the requests counter: a result that
        // has bumped `requests` but is not yet classified would otherwise
        // break `success + fail == total` for this snapshot.
        let requests = success + fail;
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);

        let elapsed = self.start.elapsed().as_secs_f64();
        let (rps, throughput) = if elapsed > 0.0 {
            (
                requests as f64 / elapsed,
                total_bytes as f64 / elapsed / 1024.0 / 1024.0,
            )
        } else {
            (0.0, 0.0)
        };
        let success_rate = if requests > 0 {
            success as f64 / requests as f64 * 100.0
        } else {
            0.0
        };

        let latency = self.histogram.snapshot();

        Report {
            total_requests: requests,
            success_count: success,
            failure_count: fail,
            assertion_failures: self.assertion_failures.load(Ordering::Relaxed),
            success_rate,
            total_bytes,
            throughput,
            rps,
            min: latency.min,
            p50: latency.p50,
            p75: latency.p75,
            p90: latency.p90,
            p95: latency.p95,
            p99: latency.p99,
            max: latency.max,
            status_codes: copy_status_map(&self.status_codes),
            errors: copy_string_map(&self.errors),
            assertion_errors: copy_string_map(&self.assertion_errors),
            protocol_counts: copy_string_map(&self.protocols),
            time_series_data: self.time_series(requests),
            ..Default::default()
        }
    }

    fn time_series(&self, requests: u64) -> Vec<SecondStats> {
        if requests == 0 {
            return Vec::new();
        }
        let total = self.max_second.load(Ordering::Relaxed) + 1;
        // Once the ring has wrapped, skip the oldest slot so the window never
        // races with a concurrent slot reset.
        let first = total.saturating_sub(RING_SECONDS as u64 - 1);
        let mut series = Vec::with_capacity((total - first) as usize);
        for second in first..total {
            let slot = &self.ring[(second % RING_SECONDS as u64) as usize];
            if slot.second.load(Ordering::Acquire) != second {
                // No traffic landed in this second.
                series.push(SecondStats {
                    second: second + 1,
                    ..Default::default()
                });
                continue;
            }
            let bucket_requests = slot.requests.load(Ordering::Relaxed);
            let latency = slot.histogram.snapshot();
            let avg_latency_ms = if bucket_requests > 0 {
                slot.total_latency_us.load(Ordering::Relaxed) as f64
                    / bucket_requests as f64
                    / 1000.0
            } else {
                0.0
            };
            series.push(SecondStats {
                second: second + 1,
                requests: bucket_requests,
                success: slot.success.load(Ordering::Relaxed),
                failures: slot.fail.load(Ordering::Relaxed),
                avg_latency_ms,
                p50: latency.p50,
                p75: latency.p75,
                p90: latency.p90,
                p95: latency.p95,
                p99: latency.p99,
                status_codes: copy_status_map(&slot.status_codes),
            });
        }
        series
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Increment a multiset counter, inserting the key race-safely on first
/// sight.
fn bump<K: std::hash::Hash + Eq>(map: &DashMap<K, AtomicU64>, key: K) {
    map.entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

/// Like `bump`, but bounded: once the map holds `MAX_ERROR_KEYS` distinct
/// keys, unseen keys fold into `"other"`. Some error strings embed ephemeral
/// data even after sanitisation, and a long test must not let them grow the
/// map without bound.
fn bump_capped(map: &DashMap<String, AtomicU64>, key: String) {
    if let Some(counter) = map.get(&key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if map.len() >= MAX_ERROR_KEYS {
        bump(map, "other".to_string());
        return;
    }
    bump(map, key);
}

fn copy_status_map(map: &DashMap<u16, AtomicU64>) -> HashMap<String, u64> {
    map.iter()
        .map(|entry| {
            let key = if *entry.key() == STATUS_TIMEOUT {
                "Timeout".to_string()
            } else {
                entry.key().to_string()
            };
            (key, entry.value().load(Ordering::Relaxed))
        })
        .collect()
}

fn copy_string_map(map: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}
