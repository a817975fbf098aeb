use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Method};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::assertions::{validate_assertions, CompiledAssertion};
use crate::breaker::CircuitBreaker;
use crate::client::{build_client, preflight, warm_up};
use crate::config::{Config, Step};
use crate::error::{Result, SaylError};
use crate::feeder::CsvFeeder;
use crate::report::Report;
use crate::scheduler::RateScheduler;
use crate::stats::{Monitor, RequestResult};
use crate::template::CompiledTemplate;
use crate::variables::VariableProcessor;

/// Bounded result queue. A lagging consumer blocks producers, which is the
/// intended back-pressure.
const RESULT_QUEUE_CAPACITY: usize = 10_000;

const DEFAULT_USER_AGENT: &str = "Sayl/1.0";

/// Breaker poll cadence.
const TICK: Duration = Duration::from_millis(100);

/// Push a snapshot to the report sink every N breaker ticks.
const SNAPSHOT_EVERY_TICKS: u64 = 2;

/// Transport error fragments worth retrying, checked case-insensitively.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "no such host",
    "dns error",
    "eof",
    "i/o timeout",
    "tls handshake timeout",
];

/// Per-step retry settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// A step with every template compiled and the method and header names
/// parsed, ready for the hot loop.
#[derive(Debug)]
struct CompiledStep {
    name: String,
    method: Method,
    url: CompiledTemplate,
    body: Option<CompiledTemplate>,
    headers: Vec<(HeaderName, CompiledTemplate)>,
    variables: Vec<(String, CompiledTemplate)>,
    extract: Vec<(String, String)>,
    assertions: Vec<CompiledAssertion>,
}

/// Session maps recycled across iterations to keep the hot loop free of
/// per-request map allocations.
#[derive(Debug, Default)]
struct SessionPool {
    free: Mutex<Vec<HashMap<String, String>>>,
}

impl SessionPool {
    fn rent(&self) -> HashMap<String, String> {
        let mut session = self.lock().pop().unwrap_or_default();
        session.clear();
        session
    }

    fn hand_back(&self, session: HashMap<String, String>) {
        self.lock().push(session);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HashMap<String, String>>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything a worker task needs, shared behind one Arc.
#[derive(Debug)]
struct WorkerContext {
    client: Client,
    scheduler: Arc<RateScheduler>,
    steps: Vec<CompiledStep>,
    feeders: Vec<(String, CsvFeeder)>,
    vp: VariableProcessor,
    retry: RetryConfig,
    pool: SessionPool,
}

/// Run metadata copied onto every emitted report.
#[derive(Debug, Clone)]
struct RunMeta {
    target_url: String,
    method: String,
    duration: Duration,
    concurrency: usize,
}

impl RunMeta {
    fn apply(&self, report: &mut Report) {
        report.target_url = self.target_url.clone();
        report.method = self.method.clone();
        report.duration = self.duration;
        report.concurrency = self.concurrency;
    }
}

/// The load-generation engine: assembles the client, feeders, scheduler and
/// monitor, runs the workers, and delivers the final report.
#[derive(Debug, Default)]
pub struct Engine {
    retry: RetryConfig,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Connectivity check before a run. HEAD with a GET fallback.
    pub async fn preflight(&self, url: &str, timeout: Duration) -> Result<()> {
        preflight(url, timeout).await
    }

    /// Execute the load test described by `cfg`. Blocks until the configured
    /// deadline or a circuit breaker trip, then drains outstanding results
    /// and returns the final report. `sink`, when present, receives
    /// incremental snapshots at no more than 10 Hz via `try_send`, so a slow
    /// receiver only misses snapshots and never stalls the test.
    pub async fn run(&self, cfg: Config, sink: Option<mpsc::Sender<Report>>) -> Result<Report> {
        // Feeder initialisation failures are fatal before any traffic.
        let mut feeders = Vec::with_capacity(cfg.data.len());
        for source in &cfg.data {
            let feeder = CsvFeeder::new(&source.path).map_err(|e| {
                SaylError::Feeder(format!("data source '{}': {e}", source.name))
            })?;
            info!(name = %source.name, rows = feeder.row_count(), "loaded data source");
            feeders.push((source.name.clone(), feeder));
        }

        let steps = effective_steps(&cfg);
        let compiled: Vec<CompiledStep> = steps
            .iter()
            .map(compile_step)
            .collect::<Result<Vec<_>>>()?;

        let breaker = match &cfg.breaker {
            Some(settings) => Some(Arc::new(CircuitBreaker::new(
                &settings.stop_if,
                settings.min_samples,
            )?)),
            None => None,
        };

        let scheduler = Arc::new(if cfg.stages.is_empty() {
            RateScheduler::fixed(cfg.rate as f64)
        } else {
            RateScheduler::staged()
        });

        let client = build_client(&cfg)?;

        let vp = VariableProcessor::new();
        let first_url = compiled[0].url.execute(&vp, &HashMap::new());
        warm_up(&client, &first_url, cfg.concurrency).await;

        let meta = RunMeta {
            target_url: steps[0].url.clone(),
            method: steps[0].method.clone(),
            duration: cfg.total_duration(),
            concurrency: cfg.concurrency,
        };

        let ctx = Arc::new(WorkerContext {
            client,
            scheduler: scheduler.clone(),
            steps: compiled,
            feeders,
            vp,
            retry: self.retry.clone(),
            pool: SessionPool::default(),
        });

        let monitor = Arc::new(Monitor::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (result_tx, mut result_rx) = mpsc::channel::<RequestResult>(RESULT_QUEUE_CAPACITY);
        let (trip_tx, trip_rx) = oneshot::channel::<()>();

        // Stage controller.
        let controller = if cfg.stages.is_empty() {
            None
        } else {
            let scheduler = scheduler.clone();
            let stages = cfg.stages.clone();
            let cancel = cancel_rx.clone();
            Some(tokio::spawn(async move {
                scheduler.run_stages(stages, cancel).await;
            }))
        };

        // Single consumer feeding the monitor.
        let consumer = {
            let monitor = monitor.clone();
            let success_codes: HashSet<u16> = cfg.success_codes.clone();
            tokio::spawn(async move {
                while let Some(result) = result_rx.recv().await {
                    let http_success =
                        result.error.is_none() && success_codes.contains(&result.status);
                    monitor.add(&result, http_success);
                }
            })
        };

        // Breaker poll plus snapshot pushes for the live view.
        let ticker = {
            let monitor = monitor.clone();
            let breaker = breaker.clone();
            let meta = meta.clone();
            let mut cancel = cancel_rx.clone();
            tokio::spawn(async move {
                let mut ticks = interval(TICK);
                let mut count: u64 = 0;
                loop {
                    tokio::select! {
                        _ = cancel.wait_for(|cancelled| *cancelled) => return,
                        _ = ticks.tick() => {}
                    }
                    count += 1;
                    if let Some(breaker) = &breaker {
                        let (total, failures, assertion_failures) = monitor.get_stats();
                        if breaker.check(total, failures, assertion_failures) {
                            warn!(reason = %breaker.reason(), "stopping test");
                            let _ = trip_tx.send(());
                            return;
                        }
                    }
                    if count % SNAPSHOT_EVERY_TICKS == 0 {
                        if let Some(sink) = &sink {
                            let mut snapshot = monitor.snapshot();
                            meta.apply(&mut snapshot);
                            let _ = sink.try_send(snapshot);
                        }
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(cfg.concurrency);
        for _ in 0..cfg.concurrency {
            let ctx = ctx.clone();
            let cancel = cancel_rx.clone();
            let results = result_tx.clone();
            workers.push(tokio::spawn(worker_loop(ctx, cancel, results)));
        }
        drop(result_tx);

        let total = cfg.total_duration();
        info!(
            duration_secs = total.as_secs_f64(),
            workers = cfg.concurrency,
            steps = ctx.steps.len(),
            "load test running"
        );

        tokio::select! {
            _ = sleep(total) => info!("test deadline reached"),
            _ = trip_rx => {}
        }
        let _ = cancel_tx.send(true);

        for worker in workers {
            let _ = worker.await;
        }
        // All producer handles are gone, so the consumer drains the queue and
        // exits on channel close.
        let _ = consumer.await;
        let _ = ticker.await;
        if let Some(controller) = controller {
            let _ = controller.await;
        }

        let mut report = monitor.snapshot();
        meta.apply(&mut report);
        if let Some(breaker) = &breaker {
            if breaker.is_tripped() {
                report.circuit_broken = true;
                report.circuit_break_reason = breaker.reason();
            }
        }
        info!(
            total_requests = report.total_requests,
            success = report.success_count,
            failures = report.failure_count,
            "load test complete"
        );
        Ok(report)
    }
}

/// The configured steps, or a single synthetic step derived from the target.
fn effective_steps(cfg: &Config) -> Vec<Step> {
    if !cfg.steps.is_empty() {
        return cfg.steps.clone();
    }
    vec![Step {
        name: "Main".to_string(),
        url: cfg.url.clone(),
        method: cfg.method.clone(),
        headers: cfg.headers.clone(),
        body: cfg.body.clone(),
        ..Step::default()
    }]
}

fn compile_step(step: &Step) -> Result<CompiledStep> {
    let method = Method::from_bytes(step.method.as_bytes())
        .map_err(|_| SaylError::Config(format!("invalid HTTP method '{}'", step.method)))?;
    let mut headers = Vec::with_capacity(step.headers.len());
    for (name, value) in &step.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| SaylError::Config(format!("invalid header name '{name}'")))?;
        headers.push((header, CompiledTemplate::compile(value)));
    }
    Ok(CompiledStep {
        name: step.name.clone(),
        method,
        url: CompiledTemplate::compile(&step.url),
        body: if step.body.is_empty() {
            None
        } else {
            Some(CompiledTemplate::compile(&step.body))
        },
        headers,
        variables: step
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), CompiledTemplate::compile(value)))
            .collect(),
        extract: step
            .extract
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect(),
        assertions: step.assertions.clone(),
    })
}

async fn worker_loop(
    ctx: Arc<WorkerContext>,
    mut cancel: watch::Receiver<bool>,
    results: mpsc::Sender<RequestResult>,
) {
    loop {
        if !ctx.scheduler.acquire(&mut cancel).await {
            return;
        }

        let mut session = ctx.pool.rent();
        for (name, feeder) in &ctx.feeders {
            for (column, value) in feeder.next_row() {
                session.insert(format!("{name}.{column}"), value.clone());
            }
        }

        let mut iteration_cancel = cancel.clone();
        let outcome = {
            let iteration = run_iteration(&ctx, &mut session, &results);
            tokio::pin!(iteration);
            tokio::select! {
                _ = iteration_cancel.wait_for(|cancelled| *cancelled) => None,
                finished = &mut iteration => Some(finished),
            }
        };
        ctx.pool.hand_back(session);

        match outcome {
            // Cancelled mid-iteration or the result channel is gone.
            None | Some(false) => return,
            Some(true) => {}
        }
    }
}

/// One pass over the scenario steps. Returns false when the result channel
/// has closed and the worker should stop.
async fn run_iteration(
    ctx: &WorkerContext,
    session: &mut HashMap<String, String>,
    results: &mpsc::Sender<RequestResult>,
) -> bool {
    for step in &ctx.steps {
        let result = execute_step_with_retry(ctx, step, session).await;
        // A transport error or an HTTP failure ends the scenario for this
        // iteration; assertion failures do not.
        let stop_chain = result.error.is_some() || result.status >= 400;
        if results.send(result).await.is_err() {
            return false;
        }
        if stop_chain {
            break;
        }
    }
    true
}

/// Retry wrapper over `execute_step`. Only transport errors matching the
/// retryable pattern set are retried, with exponential backoff and jitter.
/// Session mutations made by a failed attempt are not rolled back.
async fn execute_step_with_retry(
    ctx: &WorkerContext,
    step: &CompiledStep,
    session: &mut HashMap<String, String>,
) -> RequestResult {
    let mut attempt: u32 = 0;
    loop {
        let result = execute_step(ctx, step, session).await;
        if result.error.is_none() || !is_retryable(&result) || attempt >= ctx.retry.max_retries {
            return result;
        }
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let backoff = ctx
            .retry
            .base_delay
            .mul_f64((1u64 << attempt.min(16)) as f64 * jitter);
        debug!(
            step = %step.name,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "retrying after transport error"
        );
        sleep(backoff).await;
        attempt += 1;
    }
}

fn is_retryable(result: &RequestResult) -> bool {
    if result.timed_out {
        return true;
    }
    let Some(error) = &result.error else {
        return false;
    };
    let lowered = error.to_ascii_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

async fn execute_step(
    ctx: &WorkerContext,
    step: &CompiledStep,
    session: &mut HashMap<String, String>,
) -> RequestResult {
    let started = Instant::now();

    // Step-declared variables are evaluated first so the request templates
    // can use them.
    for (name, template) in &step.variables {
        let value = template.execute(&ctx.vp, session);
        session.insert(name.clone(), value);
    }

    let url = step.url.execute(&ctx.vp, session);

    let mut headers = HeaderMap::with_capacity(step.headers.len() + 2);
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    for (name, template) in &step.headers {
        let rendered = template.execute(&ctx.vp, session);
        match HeaderValue::from_str(&rendered) {
            Ok(value) => {
                headers.insert(name.clone(), value);
            }
            Err(_) => warn!(header = %name, "skipping header with invalid rendered value"),
        }
    }

    let mut request = ctx
        .client
        .request(step.method.clone(), url.as_str())
        .headers(headers);
    if let Some(body) = &step.body {
        request = request.body(body.execute(&ctx.vp, session));
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return RequestResult {
                started,
                latency: started.elapsed(),
                status: 0,
                bytes: 0,
                timed_out: e.is_timeout(),
                error: Some(error_chain(&e)),
                assertion_error: None,
                step_name: step.name.clone(),
                protocol: None,
            };
        }
    };

    // Latency is time to response headers, matching what the quantiles mean.
    let latency = started.elapsed();
    let status = response.status().as_u16();
    let protocol = format!("{:?}", response.version());

    // Header extraction rules read the response headers before the body is
    // consumed.
    let mut header_values: Vec<(String, String)> = Vec::new();
    for (variable, rule) in &step.extract {
        if let Some(header_name) = rule.strip_prefix("header:") {
            if let Some(value) = response
                .headers()
                .get(header_name)
                .and_then(|v| v.to_str().ok())
            {
                header_values.push((variable.clone(), value.to_string()));
            }
        }
    }

    // Extraction and assertions need the whole body; otherwise it is drained
    // to keep the connection reusable, counting bytes.
    let need_body = !step.extract.is_empty() || !step.assertions.is_empty();
    let mut body = Vec::new();
    let mut bytes: u64 = 0;
    let mut read_error: Option<(String, bool)> = None;
    if need_body {
        match response.bytes().await {
            Ok(buffered) => {
                bytes = buffered.len() as u64;
                body = buffered.to_vec();
            }
            Err(e) => read_error = Some((error_chain(&e), e.is_timeout())),
        }
    } else {
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => bytes += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    read_error = Some((error_chain(&e), e.is_timeout()));
                    break;
                }
            }
        }
    }

    if let Some((message, timed_out)) = read_error {
        return RequestResult {
            started,
            latency,
            status,
            bytes,
            timed_out,
            error: Some(message),
            assertion_error: None,
            step_name: step.name.clone(),
            protocol: Some(protocol),
        };
    }

    if !body.is_empty() {
        let text = String::from_utf8_lossy(&body);
        for (variable, rule) in &step.extract {
            if rule.starts_with("header:") {
                continue;
            }
            let value = gjson::get(&text, rule);
            if value.exists() {
                let extracted = value.str().to_string();
                // Empty results leave the session untouched.
                if !extracted.is_empty() {
                    session.insert(variable.clone(), extracted);
                }
            }
        }
    }
    for (variable, value) in header_values {
        session.insert(variable, value);
    }

    let assertion_error = if !step.assertions.is_empty() && !body.is_empty() {
        validate_assertions(&body, &step.assertions)
            .err()
            .map(|failure| failure.to_string())
    } else {
        None
    };

    RequestResult {
        started,
        latency,
        status,
        bytes,
        timed_out: false,
        error: None,
        assertion_error,
        step_name: step.name.clone(),
        protocol: Some(protocol),
    }
}

/// Join an error with its source chain so transport causes like "connection
/// refused" stay visible in the recorded message.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
