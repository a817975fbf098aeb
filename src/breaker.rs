use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SaylError};

/// Matches expressions like `errors > 10%`, `error_rate >= 0.1` or
/// `failures > 100`.
static CONDITION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(errors?|error_rate|failures?)\s*([><]=?)\s*([\d.]+)\s*(%)?\s*$")
        .expect("condition pattern is valid")
});

/// Normalised metric referenced by a stop condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMetric {
    /// Error ratio of all failed results over total.
    Errors,
    /// Same ratio, spelled as a fraction when no percent sign is given.
    ErrorRate,
    /// Absolute count of failed results.
    Failures,
}

impl BreakerMetric {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerMetric::Errors => "errors",
            BreakerMetric::ErrorRate => "error_rate",
            BreakerMetric::Failures => "failures",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Gt,
    Ge,
    Lt,
    Le,
}

/// Ends the test early once an error condition holds, after a minimum sample
/// gate. Trips exactly once; the recorded reason never changes afterwards.
#[derive(Debug)]
pub struct CircuitBreaker {
    metric: BreakerMetric,
    operator: Operator,
    threshold: f64,
    is_percent: bool,
    min_samples: u64,
    tripped: AtomicBool,
    reason: Mutex<String>,
}

impl CircuitBreaker {
    /// Parse a stop condition such as `errors > 10%`. `min_samples` of zero
    /// falls back to the default cold-start gate of 100 samples.
    pub fn new(stop_if: &str, min_samples: u64) -> Result<Self> {
        let expr = stop_if.trim();
        if expr.is_empty() {
            return Err(SaylError::Breaker(
                "empty circuit breaker condition".to_string(),
            ));
        }
        let captures = CONDITION_PATTERN.captures(expr).ok_or_else(|| {
            SaylError::Breaker(format!(
                "invalid circuit breaker condition '{expr}', expected e.g. 'errors > 10%' or 'error_rate > 0.1'"
            ))
        })?;

        let metric = match captures[1].to_ascii_lowercase().as_str() {
            "error" | "errors" => BreakerMetric::Errors,
            "failure" | "failures" => BreakerMetric::Failures,
            _ => BreakerMetric::ErrorRate,
        };
        let operator = match &captures[2] {
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "<" => Operator::Lt,
            _ => Operator::Le,
        };
        let threshold: f64 = captures[3]
            .parse()
            .map_err(|_| SaylError::Breaker(format!("invalid threshold value '{}'", &captures[3])))?;
        let is_percent = captures.get(4).is_some();

        Ok(Self {
            metric,
            operator,
            threshold,
            is_percent,
            min_samples: if min_samples == 0 { 100 } else { min_samples },
            tripped: AtomicBool::new(false),
            reason: Mutex::new(String::new()),
        })
    }

    /// Evaluate the condition against the current counters. Returns true when
    /// the breaker has tripped (now or earlier).
    pub fn check(&self, total_requests: u64, failures: u64, assertion_failures: u64) -> bool {
        if self.tripped.load(Ordering::Acquire) {
            return true;
        }
        // Cold start protection.
        if total_requests < self.min_samples {
            return false;
        }

        let total_errors = failures + assertion_failures;
        let current = match self.metric {
            BreakerMetric::Errors | BreakerMetric::ErrorRate => {
                let ratio = total_errors as f64 / total_requests as f64;
                if self.is_percent {
                    ratio * 100.0
                } else {
                    ratio
                }
            }
            BreakerMetric::Failures => total_errors as f64,
        };

        let should_trip = match self.operator {
            Operator::Gt => current > self.threshold,
            Operator::Ge => current >= self.threshold,
            Operator::Lt => current < self.threshold,
            Operator::Le => current <= self.threshold,
        };
        if !should_trip {
            return false;
        }

        if self
            .tripped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let text = if self.is_percent {
                format!(
                    "circuit breaker tripped: {} ({:.1}%) exceeded threshold ({:.1}%)",
                    self.metric.as_str(),
                    current,
                    self.threshold
                )
            } else {
                format!(
                    "circuit breaker tripped: {} ({:.3}) exceeded threshold ({:.3})",
                    self.metric.as_str(),
                    current,
                    self.threshold
                )
            };
            let mut reason = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            *reason = text;
        }
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Reason for the trip, empty while the breaker is closed.
    pub fn reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
