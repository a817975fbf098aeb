use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SaylError};

/// Durations are serialised as integer nanoseconds in the JSON report.
mod duration_ns {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Metrics for one second of the test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecondStats {
    pub second: u64,
    pub requests: u64,
    pub success: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    #[serde(with = "duration_ns")]
    pub p50: Duration,
    #[serde(with = "duration_ns")]
    pub p75: Duration,
    #[serde(with = "duration_ns")]
    pub p90: Duration,
    #[serde(with = "duration_ns")]
    pub p95: Duration,
    #[serde(with = "duration_ns")]
    pub p99: Duration,
    pub status_codes: HashMap<String, u64>,
}

/// Final (or incremental) summary of a load test run.
///
/// Snapshots own their maps and time series outright; the monitor never hands
/// out references to its internal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub target_url: String,
    pub method: String,
    /// Configured test duration.
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    pub concurrency: usize,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub assertion_failures: u64,
    pub success_rate: f64,
    pub total_bytes: u64,
    /// Megabytes per second.
    pub throughput: f64,
    pub rps: f64,
    #[serde(with = "duration_ns")]
    pub p50: Duration,
    #[serde(with = "duration_ns")]
    pub p75: Duration,
    #[serde(with = "duration_ns")]
    pub p90: Duration,
    #[serde(with = "duration_ns")]
    pub p95: Duration,
    #[serde(with = "duration_ns")]
    pub p99: Duration,
    #[serde(with = "duration_ns")]
    pub max: Duration,
    #[serde(with = "duration_ns")]
    pub min: Duration,
    pub status_codes: HashMap<String, u64>,
    pub errors: HashMap<String, u64>,
    pub assertion_errors: HashMap<String, u64>,
    pub protocol_counts: HashMap<String, u64>,
    pub time_series_data: Vec<SecondStats>,
    pub circuit_broken: bool,
    pub circuit_break_reason: String,
}

impl Report {
    /// Render a plain-text console summary.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Test Results ===");
        let _ = writeln!(out, "Target:             {} {}", self.method, self.target_url);
        let _ = writeln!(out, "Total requests:     {}", self.total_requests);
        let _ = writeln!(
            out,
            "Success:            {} ({:.1}%)",
            self.success_count, self.success_rate
        );
        let _ = writeln!(out, "Failures:           {}", self.failure_count);
        let _ = writeln!(out, "Assertion failures: {}", self.assertion_failures);
        let _ = writeln!(out, "RPS:                {:.1}", self.rps);
        let _ = writeln!(out, "Throughput:         {:.2} MB/s", self.throughput);
        let _ = writeln!(
            out,
            "Latency:            min {:.2?}  p50 {:.2?}  p95 {:.2?}  p99 {:.2?}  max {:.2?}",
            self.min, self.p50, self.p95, self.p99, self.max
        );
        let mut statuses: Vec<_> = self.status_codes.iter().collect();
        statuses.sort();
        for (code, count) in statuses {
            let _ = writeln!(out, "  status {code}: {count}");
        }
        let mut errors: Vec<_> = self.errors.iter().collect();
        errors.sort();
        for (error, count) in errors {
            let _ = writeln!(out, "  error '{error}': {count}");
        }
        if self.circuit_broken {
            let _ = writeln!(out, "Stopped early:      {}", self.circuit_break_reason);
        }
        out
    }
}

/// Write the report as pretty-printed JSON.
pub fn write_json_report(path: impl AsRef<Path>, report: &Report) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| SaylError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_durations() {
        let report = Report {
            target_url: "http://localhost/ok".to_string(),
            method: "GET".to_string(),
            duration: Duration::from_secs(10),
            p99: Duration::from_millis(42),
            total_requests: 100,
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"p99\":42000000"));
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back.p99, Duration::from_millis(42));
        assert_eq!(back.duration, Duration::from_secs(10));
    }

    #[test]
    fn json_field_names_are_stable() {
        let report = Report::default();
        let json = serde_json::to_string(&report).unwrap();
        for field in [
            "target_url",
            "total_requests",
            "success_rate",
            "throughput",
            "rps",
            "status_codes",
            "assertion_errors",
            "protocol_counts",
            "time_series_data",
            "circuit_broken",
            "circuit_break_reason",
        ] {
            assert!(json.contains(field), "missing field {field}");
        }
    }

    #[test]
    fn summary_mentions_breaker_reason() {
        let report = Report {
            circuit_broken: true,
            circuit_break_reason: "circuit breaker tripped: errors (20.0%) exceeded threshold (10.0%)".to_string(),
            ..Default::default()
        };
        assert!(report.render_summary().contains("Stopped early"));
    }

    #[test]
    fn writes_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_json_report(&path, &Report::default()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("total_requests"));
    }
}
