//! End-to-end tests for the load engine against local mock origin servers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use sayl::config::{BreakerConfig, Config, Step};
use sayl::engine::{Engine, RetryConfig};
use sayl::report::Report;

/// Serve a closure-based handler on an ephemeral port.
async fn start_server<H>(handler: H) -> SocketAddr
where
    H: Fn(Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req)) }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn fixed_rate_config(addr: SocketAddr, rate: u32, duration: Duration, concurrency: usize) -> Config {
    Config {
        url: format!("http://{addr}/ok"),
        rate,
        duration,
        concurrency,
        ..Config::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_rate_get_sustains_the_configured_rate() {
    let addr = start_server(|_req| Response::new(Body::from("ok"))).await;
    let cfg = fixed_rate_config(addr, 50, Duration::from_secs(2), 8);

    let report = Engine::new().run(cfg, None).await.unwrap();

    let total = report.total_requests;
    assert!(
        (85..=115).contains(&total),
        "expected about 100 requests at 50 rps over 2s, got {total}"
    );
    assert_eq!(report.success_count, total);
    assert_eq!(report.failure_count, 0);
    assert_eq!(report.status_codes.len(), 1);
    assert_eq!(report.status_codes["200"], total);
    assert!(report.errors.is_empty());
    assert!(report.p99 < Duration::from_millis(200), "p99 = {:?}", report.p99);
    assert!(report.throughput > 0.0);
    assert!(report.rps > 0.0);
    assert!(!report.time_series_data.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chained_scenario_threads_extracted_token() {
    let addr = start_server(|req| {
        match (req.method().as_str(), req.uri().path()) {
            ("POST", "/login") => Response::builder()
                .header("content-type", "application/json")
                .body(Body::from(r#"{"token":"T-123"}"#))
                .unwrap(),
            ("GET", "/me") => {
                let authorized = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer T-123");
                if authorized {
                    Response::new(Body::from(r#"{"user":"u"}"#))
                } else {
                    Response::builder()
                        .status(StatusCode::UNAUTHORIZED)
                        .body(Body::from("denied"))
                        .unwrap()
                }
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap(),
        }
    })
    .await;

    let cfg = Config {
        rate: 10,
        duration: Duration::from_secs(1),
        concurrency: 4,
        steps: vec![
            Step {
                name: "login".to_string(),
                url: format!("http://{addr}/login"),
                method: "POST".to_string(),
                body: r#"{"u":"a"}"#.to_string(),
                extract: [("token".to_string(), "token".to_string())].into(),
                ..Step::default()
            },
            Step {
                name: "me".to_string(),
                url: format!("http://{addr}/me"),
                method: "GET".to_string(),
                headers: [(
                    "Authorization".to_string(),
                    "Bearer {{token}}".to_string(),
                )]
                .into(),
                ..Step::default()
            },
        ],
        ..Config::default()
    };

    let report = Engine::new().run(cfg, None).await.unwrap();

    // The second step only returns 200 when the extracted token reached its
    // Authorization header, so an all-200 run proves the chain worked.
    assert!(report.total_requests >= 4);
    assert_eq!(report.failure_count, 0);
    assert_eq!(report.status_codes.len(), 1);
    assert_eq!(report.status_codes["200"], report.total_requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assertion_failures_are_classified_separately() {
    let addr = start_server(|_req| Response::new(Body::from(r#"{"v":2}"#))).await;

    let assertion =
        sayl::assertions::CompiledAssertion::compile("json_path", "1", "v", None).unwrap();
    let cfg = Config {
        rate: 30,
        duration: Duration::from_secs(1),
        concurrency: 4,
        steps: vec![Step {
            name: "check".to_string(),
            url: format!("http://{addr}/v"),
            method: "GET".to_string(),
            assertions: vec![assertion],
            ..Step::default()
        }],
        ..Config::default()
    };

    let report = Engine::new().run(cfg, None).await.unwrap();

    assert!(report.total_requests > 0);
    assert_eq!(report.assertion_failures, report.total_requests);
    assert_eq!(report.failure_count, report.total_requests);
    assert_eq!(report.success_count, 0);
    // The responses themselves were fine, only the assertion failed.
    assert_eq!(report.status_codes["200"], report.total_requests);
    assert!(report.errors.is_empty());
    assert!(!report.assertion_errors.is_empty());
    let message = report.assertion_errors.keys().next().unwrap();
    assert!(message.contains("expected '1', got '2'"), "got: {message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn circuit_breaker_stops_a_failing_test() {
    let hits = Arc::new(AtomicU64::new(0));
    let addr = {
        let hits = hits.clone();
        start_server(move |_req| {
            let n = hits.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 3 == 0 {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("boom"))
                    .unwrap()
            } else {
                Response::new(Body::from("ok"))
            }
        })
        .await
    };

    let cfg = Config {
        rate: 300,
        duration: Duration::from_secs(10),
        concurrency: 16,
        breaker: Some(BreakerConfig {
            stop_if: "errors > 10%".to_string(),
            min_samples: 200,
        }),
        ..fixed_rate_config(addr, 0, Duration::ZERO, 0)
    };

    let started = Instant::now();
    let report = Engine::new().run(cfg, None).await.unwrap();
    let elapsed = started.elapsed();

    assert!(report.circuit_broken);
    assert!(
        report
            .circuit_break_reason
            .contains("exceeded threshold (10.0%)"),
        "reason: {}",
        report.circuit_break_reason
    );
    assert!(report.circuit_break_reason.contains("errors ("));
    assert!(
        report.total_requests >= 200 && report.total_requests <= 2000,
        "total = {}",
        report.total_requests
    );
    assert!(
        elapsed < Duration::from_secs(6),
        "breaker should cut the 10s run short, ran {elapsed:?}"
    );
}

/// A TCP listener that drops its first connections outright, then speaks
/// just enough HTTP/1.1 to serve 200s on a keep-alive connection.
async fn flaky_tcp_server(drop_first: u32) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut accepted: u32 = 0;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            accepted += 1;
            if accepted <= drop_first {
                drop(stream);
                continue;
            }
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let response =
                                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: keep-alive\r\n\r\nok";
                            if stream.write_all(response).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_errors_are_retried_into_successes() {
    // Two warm-up probes plus the first couple of real requests hit dropped
    // connections; retries must absorb all of it.
    let addr = flaky_tcp_server(4).await;

    let cfg = Config {
        url: format!("http://{addr}/"),
        rate: 20,
        duration: Duration::from_secs(1),
        concurrency: 4,
        ..Config::default()
    };
    let engine = Engine::with_retry(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(20),
    });

    let report = engine.run(cfg, None).await.unwrap();

    assert!(report.total_requests >= 5);
    // Retries collapse into one reported success per iteration.
    assert_eq!(
        report.success_count, report.total_requests,
        "errors: {:?}",
        report.errors
    );
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    assert_eq!(report.status_codes["200"], report.total_requests);
}

/// Serve responses after a fixed delay without blocking the runtime.
async fn slow_server(delay: Duration) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |_req| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, Infallible>(Response::new(Body::from("late")))
        }))
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_timeouts_are_reclassified() {
    let addr = slow_server(Duration::from_millis(500)).await;

    let cfg = Config {
        url: format!("http://{addr}/slow"),
        rate: 5,
        duration: Duration::from_secs(1),
        concurrency: 2,
        timeout: Duration::from_millis(100),
        ..Config::default()
    };
    // No retries, so every timeout is reported as-is.
    let engine = Engine::with_retry(RetryConfig {
        max_retries: 0,
        base_delay: Duration::from_millis(10),
    });

    let report = engine.run(cfg, None).await.unwrap();

    assert!(report.total_requests > 0);
    assert_eq!(report.success_count, 0);
    assert_eq!(report.status_codes.len(), 1);
    assert_eq!(report.status_codes["Timeout"], report.total_requests);
    assert!(!report.errors.is_empty());
    // Failed requests never enter the latency histogram.
    assert_eq!(report.max, Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_staged_ramp_generates_traffic() {
    let addr = start_server(|_req| Response::new(Body::from("ok"))).await;
    let cfg = Config {
        url: format!("http://{addr}/ok"),
        stages: vec![
            sayl::config::Stage {
                duration: Duration::from_secs(1),
                target_rate: 20,
            },
            sayl::config::Stage {
                duration: Duration::from_secs(1),
                target_rate: 0,
            },
        ],
        concurrency: 8,
        ..Config::default()
    };

    let report = Engine::new().run(cfg, None).await.unwrap();

    // Roughly 10 requests on the way up, a handful on the way down.
    assert!(
        (5..=40).contains(&(report.total_requests as i64)),
        "total = {}",
        report.total_requests
    );
    assert_eq!(report.failure_count, 0);
    assert_eq!(report.duration, Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sink_receives_incremental_snapshots() {
    let addr = start_server(|_req| Response::new(Body::from("ok"))).await;
    let cfg = fixed_rate_config(addr, 40, Duration::from_secs(2), 4);

    let (sink_tx, mut sink_rx) = mpsc::channel::<Report>(64);
    let collector = tokio::spawn(async move {
        let mut snapshots = Vec::new();
        while let Some(snapshot) = sink_rx.recv().await {
            snapshots.push(snapshot);
        }
        snapshots
    });

    let report = Engine::new().run(cfg, Some(sink_tx)).await.unwrap();
    let snapshots = collector.await.unwrap();

    assert!(!snapshots.is_empty());
    // At most 10 Hz over a 2 second run.
    assert!(snapshots.len() <= 21, "got {} snapshots", snapshots.len());
    // Totals never go backwards between snapshots.
    let mut previous = 0;
    for snapshot in &snapshots {
        assert!(snapshot.total_requests >= previous);
        previous = snapshot.total_requests;
        assert_eq!(snapshot.target_url, report.target_url);
    }
    assert!(report.total_requests >= previous);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_error_aborts_the_scenario_chain() {
    let second_step_hits = Arc::new(AtomicU64::new(0));
    let addr = {
        let second_step_hits = second_step_hits.clone();
        start_server(move |req| match req.uri().path() {
            "/first" => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("broken"))
                .unwrap(),
            _ => {
                second_step_hits.fetch_add(1, Ordering::Relaxed);
                Response::new(Body::from("ok"))
            }
        })
        .await
    };

    let cfg = Config {
        rate: 20,
        duration: Duration::from_secs(1),
        concurrency: 4,
        steps: vec![
            Step {
                name: "first".to_string(),
                url: format!("http://{addr}/first"),
                method: "GET".to_string(),
                ..Step::default()
            },
            Step {
                name: "second".to_string(),
                url: format!("http://{addr}/second"),
                method: "GET".to_string(),
                ..Step::default()
            },
        ],
        ..Config::default()
    };

    let report = Engine::new().run(cfg, None).await.unwrap();

    assert!(report.total_requests > 0);
    assert_eq!(report.status_codes["500"], report.total_requests);
    // The 500 on step one stopped every iteration before step two.
    assert_eq!(second_step_hits.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preflight_succeeds_against_live_server_and_fails_otherwise() {
    let addr = start_server(|_req| Response::new(Body::from("ok"))).await;
    let engine = Engine::new();
    engine
        .preflight(&format!("http://{addr}/"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(engine
        .preflight("http://127.0.0.1:1/", Duration::from_millis(300))
        .await
        .is_err());
}
