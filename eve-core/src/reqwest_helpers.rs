use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::Extensions;
use reqwest::{Client, Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{default_on_request_failure, Retryable, RetryableStrategy, RetryTransientMiddleware};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    /// Sustained requests per second across the whole process.
    pub sustained: u32,
    pub burst: u32,
    /// Total attempt budget per request, first try included.
    pub max_attempts: u32,
}

impl Default for RateBudget {
    fn default() -> Self {
        RateBudget {
            sustained: 20,
            burst: 150,
            max_attempts: 4,
        }
    }
}

/// Builds the shared upstream client: one process-wide token bucket, a
/// retry layer for transient upstream failures, and request logging.
pub fn create_client(user_agent: &str, budget: RateBudget) -> ClientWithMiddleware {
    let reqwest_client = Client::builder().build().expect("reqwest client construction cannot fail with default TLS");

    let sustained = NonZeroU32::new(budget.sustained.max(1)).expect("non-zero by max(1)");
    let burst = NonZeroU32::new(budget.burst.max(1)).expect("non-zero by max(1)");
    let limiter = RateLimiter::direct(Quota::per_second(sustained).allow_burst(burst));

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_secs(1), Duration::from_secs(8))
        .build_with_max_retries(budget.max_attempts.saturating_sub(1));

    ClientBuilder::new(reqwest_client)
        .with(RetryTransientMiddleware::new_with_policy_and_strategy(retry_policy, UpstreamRetryStrategy))
        .with(ErrorLoggingMiddleware)
        .with(RateLimitingMiddleware { limiter: Arc::new(limiter) })
        .with(UserAgentMiddleware {
            user_agent: user_agent.to_string(),
        })
        .build()
}

/// Retries 5xx and the upstream rate-limit signals (420, 429) only.
/// Client-side errors are final; connection failures defer to the default
/// classification.
struct UpstreamRetryStrategy;

impl RetryableStrategy for UpstreamRetryStrategy {
    fn handle(&self, res: &reqwest_middleware::Result<Response>) -> Option<Retryable> {
        match res {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 420 {
                    Some(Retryable::Transient)
                } else {
                    None
                }
            }
            Err(error) => default_on_request_failure(error),
        }
    }
}

struct UserAgentMiddleware {
    user_agent: String,
}

#[async_trait::async_trait]
impl Middleware for UserAgentMiddleware {
    async fn handle(&self, mut req: Request, extensions: &mut Extensions, next: Next<'_>) -> reqwest_middleware::Result<Response> {
        req.headers_mut().insert(
            reqwest::header::USER_AGENT,
            self.user_agent
                .parse()
                .unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("eve-route-optimizer")),
        );

        next.run(req, extensions).await
    }
}

struct RateLimitingMiddleware {
    limiter: Arc<DefaultDirectRateLimiter>,
}

#[async_trait::async_trait]
impl Middleware for RateLimitingMiddleware {
    async fn handle(&self, req: Request, extensions: &mut Extensions, next: Next<'_>) -> reqwest_middleware::Result<Response> {
        self.limiter.until_ready().await;

        next.run(req, extensions).await
    }
}

pub struct ErrorLoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for ErrorLoggingMiddleware {
    async fn handle(&self, req: Request, extensions: &mut Extensions, next: Next<'_>) -> reqwest_middleware::Result<Response> {
        let start = Instant::now();
        let method = req.method().clone();
        let url = req.url().clone();

        let result = next.run(req, extensions).await;

        let duration = start.elapsed();

        match &result {
            Ok(resp) if !resp.status().is_success() => {
                let status = resp.status();

                match status {
                    StatusCode::NOT_MODIFIED => {
                        debug!("Request not modified: {} {} - Duration: {:?}", method, url, duration);
                    }
                    StatusCode::TOO_MANY_REQUESTS => {
                        debug!("Request failed due to rate-limit {} {} - Status: {}, Duration: {:?}", method, url, status, duration)
                    }
                    _ => error!("Request failed: {} {} - Status: {}, Duration: {:?}", method, url, status, duration),
                }
            }
            Err(e) => {
                error!("Request error: {} {} - Error: {}, Duration: {:?}", method, url, e, duration);
            }
            _ => {
                debug!("Request succeeded: {} {} - Duration: {:?}", method, url, duration);
            }
        }

        result
    }
}
