use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::assertions::CompiledAssertion;
use crate::breaker::CircuitBreaker;
use crate::error::{Result, SaylError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONCURRENCY: usize = 10;

/// One segment of a staged load profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    /// Requests per second at the end of the stage. Zero halts traffic.
    pub target_rate: u32,
}

/// A named external CSV data source.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    pub path: String,
}

/// Circuit breaker settings, validated at load time.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub stop_if: String,
    pub min_samples: u64,
}

/// A single request within a chained scenario. All templated fields stay as
/// raw strings here; the engine compiles them once before spawning workers.
#[derive(Debug, Clone, Default)]
pub struct Step {
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Variable name to JSON path or `header:<Name>` extraction rule.
    pub extract: HashMap<String, String>,
    /// Variables evaluated before the request and stored in the session.
    pub variables: HashMap<String, String>,
    pub assertions: Vec<CompiledAssertion>,
}

/// Validated, immutable parameters of a load test run.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub timeout: Duration,
    pub insecure: bool,
    pub keep_alive: bool,
    pub http2: bool,
    pub h2c: bool,
    pub duration: Duration,
    /// Requests per second for the fixed-rate profile.
    pub rate: u32,
    pub concurrency: usize,
    pub success_codes: HashSet<u16>,
    pub stages: Vec<Stage>,
    pub steps: Vec<Step>,
    pub data: Vec<DataSource>,
    pub breaker: Option<BreakerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: String::new(),
            timeout: DEFAULT_TIMEOUT,
            insecure: false,
            keep_alive: true,
            http2: true,
            h2c: false,
            duration: Duration::ZERO,
            rate: 0,
            concurrency: DEFAULT_CONCURRENCY,
            success_codes: HashSet::from([200]),
            stages: Vec::new(),
            steps: Vec::new(),
            data: Vec::new(),
            breaker: None,
        }
    }
}

/// Raw YAML shape of the scenario file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    target: RawTarget,
    load: RawLoad,
    steps: Vec<RawStep>,
    data: Vec<RawData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawData {
    name: String,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTarget {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: String,
    body_file: String,
    body_json: Option<serde_yaml::Value>,
    timeout: String,
    insecure: bool,
    keep_alive: Option<bool>,
    http2: Option<bool>,
    h2c: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLoad {
    duration: String,
    rate: u32,
    concurrency: usize,
    success_codes: Vec<u16>,
    stop_if: String,
    min_samples: u64,
    stages: Vec<RawStage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStage {
    duration: String,
    target: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStep {
    name: String,
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: String,
    body_file: String,
    body_json: Option<serde_yaml::Value>,
    extract: HashMap<String, String>,
    variables: HashMap<String, String>,
    /// Alias for `variables`.
    save: HashMap<String, String>,
    assertions: Vec<RawAssertion>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAssertion {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    path: String,
    message: String,
}

/// Load and validate a YAML scenario file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        SaylError::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let raw: RawConfig = serde_yaml::from_str(&text)
        .map_err(|e| SaylError::Config(format!("failed to parse config file: {e}")))?;
    debug!(steps = raw.steps.len(), data_sources = raw.data.len(), "loaded scenario file");

    let mut cfg = Config {
        url: raw.target.url,
        method: raw.target.method,
        headers: raw.target.headers,
        body: resolve_body(&raw.target.body, &raw.target.body_file, raw.target.body_json.as_ref())?,
        insecure: raw.target.insecure,
        keep_alive: raw.target.keep_alive.unwrap_or(true),
        http2: raw.target.http2.unwrap_or(true),
        h2c: raw.target.h2c,
        rate: raw.load.rate,
        concurrency: if raw.load.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            raw.load.concurrency
        },
        ..Config::default()
    };

    cfg.timeout = parse_duration_field(&raw.target.timeout, "target.timeout")?
        .unwrap_or(DEFAULT_TIMEOUT);
    cfg.duration =
        parse_duration_field(&raw.load.duration, "load.duration")?.unwrap_or(Duration::ZERO);

    for (index, stage) in raw.load.stages.iter().enumerate() {
        let duration = parse_duration_field(&stage.duration, "stage duration")?
            .ok_or_else(|| {
                SaylError::Config(format!("load.stages[{index}].duration is required"))
            })?;
        cfg.stages.push(Stage {
            duration,
            target_rate: stage.target,
        });
    }

    for raw_step in raw.steps {
        let mut variables = raw_step.variables;
        for (name, value) in raw_step.save {
            variables.insert(name, value);
        }
        let mut assertions = Vec::with_capacity(raw_step.assertions.len());
        for assertion in &raw_step.assertions {
            let compiled = CompiledAssertion::compile(
                if assertion.kind.is_empty() {
                    "contains"
                } else {
                    &assertion.kind
                },
                &assertion.value,
                &assertion.path,
                if assertion.message.is_empty() {
                    None
                } else {
                    Some(assertion.message.clone())
                },
            )
            .map_err(|e| SaylError::Config(format!("step '{}': {e}", raw_step.name)))?;
            assertions.push(compiled);
        }
        cfg.steps.push(Step {
            name: raw_step.name,
            url: raw_step.url,
            method: raw_step.method,
            headers: raw_step.headers,
            body: resolve_body(&raw_step.body, &raw_step.body_file, raw_step.body_json.as_ref())?,
            extract: raw_step.extract,
            variables,
            assertions,
        });
    }

    for source in raw.data {
        cfg.data.push(DataSource {
            name: source.name,
            path: source.path,
        });
    }

    if !raw.load.success_codes.is_empty() {
        cfg.success_codes = raw.load.success_codes.into_iter().collect();
    }

    if !raw.load.stop_if.is_empty() {
        // Parse now so an invalid expression fails the load, not the run.
        CircuitBreaker::new(&raw.load.stop_if, raw.load.min_samples)?;
        cfg.breaker = Some(BreakerConfig {
            stop_if: raw.load.stop_if,
            min_samples: raw.load.min_samples,
        });
    }

    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Check the run invariants, filling remaining defaults in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.url.is_empty() && self.steps.is_empty() {
            return Err(SaylError::Config(
                "either target.url or steps must be provided".to_string(),
            ));
        }

        if self.method.is_empty() {
            self.method = "GET".to_string();
        } else {
            self.method = validate_method(&self.method, "target.method")?;
        }

        if !self.stages.is_empty() {
            if self.rate > 0 || !self.duration.is_zero() {
                return Err(SaylError::Config(
                    "specify either load.rate with load.duration or load.stages, not both"
                        .to_string(),
                ));
            }
            for (index, stage) in self.stages.iter().enumerate() {
                if stage.duration.is_zero() {
                    return Err(SaylError::Config(format!(
                        "load.stages[{index}].duration must be greater than 0"
                    )));
                }
            }
        } else {
            if self.rate == 0 {
                return Err(SaylError::Config(
                    "load.rate must be greater than 0".to_string(),
                ));
            }
            if self.duration.is_zero() {
                return Err(SaylError::Config(
                    "load.duration must be greater than 0".to_string(),
                ));
            }
        }

        if self.concurrency == 0 {
            return Err(SaylError::Config(
                "load.concurrency must be at least 1".to_string(),
            ));
        }

        for (index, step) in self.steps.iter_mut().enumerate() {
            if step.url.is_empty() {
                return Err(SaylError::Config(format!("steps[{index}].url is required")));
            }
            if step.method.is_empty() {
                return Err(SaylError::Config(format!(
                    "steps[{index}].method is required"
                )));
            }
            step.method = validate_method(&step.method, &format!("steps[{index}].method"))?;
        }

        if self.success_codes.is_empty() {
            self.success_codes = HashSet::from([200]);
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        Ok(())
    }

    /// Total run length, from the fixed duration or the sum of all stages.
    pub fn total_duration(&self) -> Duration {
        if self.stages.is_empty() {
            self.duration
        } else {
            self.stages.iter().map(|s| s.duration).sum()
        }
    }
}

fn validate_method(method: &str, field: &str) -> Result<String> {
    let upper = method.to_ascii_uppercase();
    match upper.as_str() {
        "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS" => Ok(upper),
        _ => Err(SaylError::Config(format!(
            "{field}: invalid HTTP method '{method}', expected GET, POST, PUT, DELETE, PATCH, HEAD or OPTIONS"
        ))),
    }
}

fn parse_duration_field(value: &str, field: &str) -> Result<Option<Duration>> {
    if value.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| SaylError::Config(format!("{field}: invalid duration '{value}': {e}")))
}

/// Body precedence: external file, then inline string, then structured JSON.
fn resolve_body(
    body: &str,
    body_file: &str,
    body_json: Option<&serde_yaml::Value>,
) -> Result<String> {
    if !body_file.is_empty() {
        return std::fs::read_to_string(body_file)
            .map_err(|e| SaylError::Config(format!("failed to read body file '{body_file}': {e}")));
    }
    if !body.is_empty() {
        return Ok(body.to_string());
    }
    if let Some(value) = body_json {
        let json: serde_json::Value = serde_yaml::from_value(value.clone())
            .map_err(|e| SaylError::Config(format!("invalid body_json: {e}")))?;
        return Ok(json.to_string());
    }
    Ok(String::new())
}
