use std::time::Instant;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::Config;

const USER_AGENT: &str = "SEI-Manager/1.0 (+https://example.local)";

/// Transport-level fetch failure, surfaced after the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed with status {status}")]
    Status { status: u16 },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

fn retriable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Accept only absolute http(s) URLs before spending network budget.
pub fn validate_url(raw: &str) -> Result<url::Url, String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("unsupported scheme: {other}")),
    }
}

/// Fetch a portal page as text. A single logical call makes up to
/// `retries + 1` physical attempts; 429, 5xx and transport errors (including
/// the per-attempt timeout) are retried with exponential backoff, any other
/// non-2xx status fails immediately.
pub async fn fetch_html(client: &Client, url: &str, cfg: &Config) -> Result<String, FetchError> {
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(cfg.fetch_timeout)
            .send()
            .await;

        let failure: FetchError = match response {
            Ok(res) => {
                let status = res.status().as_u16();
                let duration_ms = started.elapsed().as_millis() as u64;
                if res.status().is_success() {
                    match res.text().await {
                        Ok(body) => {
                            info!(
                                component = "fetch_html",
                                url,
                                status,
                                duration_ms,
                                size_bytes = body.len(),
                                "fetch ok"
                            );
                            return Ok(body);
                        }
                        // Body read aborted mid-stream counts as transport.
                        Err(e) => FetchError::Transport(e),
                    }
                } else {
                    warn!(
                        component = "fetch_html",
                        url, status, duration_ms, "fetch returned error status"
                    );
                    if !retriable_status(status) {
                        return Err(FetchError::Status { status });
                    }
                    FetchError::Status { status }
                }
            }
            Err(e) => {
                warn!(
                    component = "fetch_html",
                    url,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "fetch transport failure"
                );
                FetchError::Transport(e)
            }
        };

        if attempt >= cfg.fetch_retries {
            return Err(failure);
        }
        attempt += 1;
        let backoff = cfg.fetch_retry_base * 2u32.pow(attempt - 1);
        warn!(
            component = "fetch_html",
            url,
            attempt,
            max_retries = cfg.fetch_retries,
            backoff_ms = backoff.as_millis() as u64,
            "backing off before retry"
        );
        tokio::time::sleep(backoff).await;
    }
}
