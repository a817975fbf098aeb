use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SaylError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Build the shared connection-pooled client from the transport settings.
///
/// The idle pool is sized `max(100, 2 x concurrency)` so workers never starve
/// on connections. With `http2` the protocol is negotiated via ALPN and falls
/// back to HTTP/1.1 automatically; `h2c` forces prior-knowledge HTTP/2 over
/// plain TCP instead. Disabled keep-alive drops the idle pool to zero so
/// every request dials fresh.
pub fn build_client(cfg: &Config) -> Result<Client> {
    let pool_size = std::cmp::max(100, cfg.concurrency * 2);
    let timeout = if cfg.timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        cfg.timeout
    };

    let mut builder = Client::builder()
        .pool_max_idle_per_host(if cfg.keep_alive { pool_size } else { 0 })
        .pool_idle_timeout(IDLE_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .danger_accept_invalid_certs(cfg.insecure);
    if cfg.keep_alive {
        builder = builder.tcp_keepalive(Duration::from_secs(30));
    }
    if cfg.h2c {
        builder = builder.http2_prior_knowledge();
    } else if !cfg.http2 {
        builder = builder.http1_only();
    }

    builder
        .build()
        .map_err(|e| SaylError::Client(e.to_string()))
}

/// Number of warm-up connections for a given worker count.
pub fn warmup_connections(concurrency: usize) -> usize {
    (concurrency / 4).clamp(2, 32)
}

/// Pre-establish connections with parallel HEAD requests to the first target.
/// Best effort, failures are ignored.
pub async fn warm_up(client: &Client, url: &str, concurrency: usize) {
    let count = warmup_connections(concurrency);
    debug!(connections = count, url = %url, "warming up connection pool");
    let requests = (0..count).map(|_| {
        let client = client.clone();
        let url = url.to_string();
        async move {
            if let Err(e) = client.head(&url).send().await {
                debug!(error = %e, "warm-up request failed");
            }
        }
    });
    join_all(requests).await;
}

/// Verify the target answers at all before starting the load test. Tries
/// HEAD first and falls back to GET, draining the body so the connection can
/// be reused.
pub async fn preflight(url: &str, timeout: Duration) -> Result<()> {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(10)
    } else {
        timeout
    };
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SaylError::Client(e.to_string()))?;

    let head = client
        .head(url)
        .header(reqwest::header::USER_AGENT, "Sayl/1.0 Preflight")
        .send()
        .await;
    let response = match head {
        Ok(response) => response,
        Err(head_err) => {
            warn!(error = %head_err, "preflight HEAD failed, retrying with GET");
            client
                .get(url)
                .header(reqwest::header::USER_AGENT, "Sayl/1.0 Preflight")
                .send()
                .await
                .map_err(|e| SaylError::Preflight(e.to_string()))?
        }
    };
    let _ = response.bytes().await;
    Ok(())
}
