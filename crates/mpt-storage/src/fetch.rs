//! Fetch collaborator: turns a URL into raw bytes plus an HTTP status.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("{url} still unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        url: String,
        attempts: u32,
        reason: String,
    },
}

/// Stateless page source. The scrape loop calls it once per URL and owns pacing.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_one(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// How politely the platform is visited: one page load per `page_delay`, and a URL that
/// answers with a transient failure is tried again up to `attempts` times in total.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub user_agent: String,
    pub attempts: u32,
    pub page_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "mpt-bot/0.1".to_string(),
            attempts: 3,
            page_delay: Duration::from_secs(2),
        }
    }
}

impl FetchPolicy {
    /// Wait before retry number `retry` (1-based): that many page delays.
    pub fn retry_wait(&self, retry: u32) -> Duration {
        self.page_delay.saturating_mul(retry)
    }
}

/// Throttling and server-side failures may clear up; anything else is the page's answer.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl HttpFetcher {
    pub fn new(policy: FetchPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(policy.timeout)
            .user_agent(policy.user_agent.clone())
            .build()
            .context("building http client")?;
        Ok(Self { client, policy })
    }

    /// Returns any non-transient response as a page, including 4xx ones; the caller decides
    /// what a non-success status means. Transient failures are retried until the policy's
    /// attempts are spent.
    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let attempts = self.policy.attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let wait = self.policy.retry_wait(attempt - 1);
                tracing::debug!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    reason = %last_failure,
                    "retrying"
                );
                tokio::time::sleep(wait).await;
            }

            match self.client.get(url).send().await {
                Ok(resp) if is_transient_status(resp.status()) => {
                    last_failure = format!("http status {}", resp.status().as_u16());
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body,
                    });
                }
                Err(err) if is_transient_error(&err) => {
                    last_failure = err.to_string();
                }
                Err(err) => return Err(FetchError::Request(err)),
            }
        }

        Err(FetchError::Unavailable {
            url: url.to_string(),
            attempts,
            reason: last_failure,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_one(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = tracing::info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Fetcher for the loopback test server, bypassing any proxy set in the environment.
    fn local_fetcher(attempts: u32) -> HttpFetcher {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");
        HttpFetcher {
            client,
            policy: FetchPolicy {
                attempts,
                page_delay: Duration::ZERO,
                ..FetchPolicy::default()
            },
        }
    }

    /// Serves one canned response per accepted connection, in order.
    async fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/delivery/athina/gyros-house")
    }

    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const MENU: &str =
        "HTTP/1.1 200 OK\r\ncontent-length: 11\r\nconnection: close\r\n\r\n<p>menu</p>";
    const GONE: &str =
        "HTTP/1.1 404 Not Found\r\ncontent-length: 4\r\nconnection: close\r\n\r\ngone";

    #[test]
    fn retries_back_off_in_units_of_the_page_delay() {
        let policy = FetchPolicy {
            page_delay: Duration::from_millis(500),
            ..FetchPolicy::default()
        };
        assert_eq!(policy.retry_wait(1), Duration::from_millis(500));
        assert_eq!(policy.retry_wait(3), Duration::from_millis(1500));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn success_covers_the_2xx_range() {
        let page = |status| FetchedPage {
            status,
            final_url: "https://example.test".to_string(),
            body: Vec::new(),
        };
        assert!(page(200).is_success());
        assert!(page(204).is_success());
        assert!(!page(301).is_success());
        assert!(!page(500).is_success());
    }

    #[tokio::test]
    async fn server_error_is_retried_until_the_page_loads() {
        let url = serve(vec![UNAVAILABLE, MENU]).await;
        let fetcher = local_fetcher(3);

        let page = fetcher.fetch_one(&url).await.expect("page");
        assert_eq!(page.status, 200);
        assert_eq!(page.body, b"<p>menu</p>");
    }

    #[tokio::test]
    async fn client_errors_are_returned_without_retrying() {
        let url = serve(vec![GONE, MENU]).await;
        let fetcher = local_fetcher(3);

        let page = fetcher.fetch_one(&url).await.expect("page");
        assert_eq!(page.status, 404);
        assert!(!page.is_success());
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_url_unavailable() {
        let url = serve(vec![UNAVAILABLE, UNAVAILABLE]).await;
        let fetcher = local_fetcher(2);

        let err = fetcher.fetch_one(&url).await.unwrap_err();
        match err {
            FetchError::Unavailable {
                url: failed,
                attempts,
                reason,
            } => {
                assert_eq!(failed, url);
                assert_eq!(attempts, 2);
                assert!(reason.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
