pub mod buckets;
pub mod routes;

use std::time::Duration;

use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::Instant;

use crate::backoff::ExponentialBackoff;
use crate::config::HttpConfig;
use crate::error::HttpError;
use buckets::{BucketStore, GlobalGate};
use routes::CompiledRoute;

const AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";

/// Per-request knobs beyond the route itself.
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Recorded in the guild's audit log next to the resulting entry.
    pub reason: Option<String>,
    /// Set to skip the Authorization header on routes that take none.
    pub no_auth: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn no_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }
}

/// What one wire exchange decided.
enum Attempt {
    Done(Option<Value>),
    /// A 429; the corrected bucket or armed global gate blocks the next
    /// loop iteration for the right duration, so no backoff is spent.
    RateLimited,
    /// Transient failure. Carries the error to surface if the backoff
    /// budget runs out before a retry succeeds.
    Retry(Option<HttpError>),
}

/// Rate-limited REST client.
///
/// All rate-limit state (per-bucket windows and the global gate) lives on
/// the instance; clones of the inner `reqwest::Client` share connection
/// pools but two `RestClient`s never share limits.
pub struct RestClient {
    config: HttpConfig,
    client: reqwest::Client,
    store: BucketStore,
    global: GlobalGate,
}

impl RestClient {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            store: BucketStore::new(),
            global: GlobalGate::new(),
        }
    }

    /// Perform `route`, retrying transient failures and waiting out rate
    /// limits. `Ok(None)` is a 204; permanent API errors come back as
    /// their distinct `HttpError` kinds without any retry.
    pub async fn request(
        &self,
        route: &CompiledRoute,
        options: RequestOptions,
    ) -> Result<Option<Value>, HttpError> {
        let mut backoff = ExponentialBackoff::default();
        let mut attempts: u32 = 0;

        loop {
            self.store.bucket_for(route).acquire().await;
            self.global.acquire().await;

            match self.perform(route, &options).await? {
                Attempt::Done(body) => return Ok(body),
                Attempt::RateLimited => continue,
                Attempt::Retry(fallback) => {
                    attempts += 1;
                    let delay = if attempts >= self.config.max_retries {
                        None
                    } else {
                        backoff.next()
                    };
                    match delay {
                        Some(delay) => {
                            tracing::warn!(
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                path = %route.compiled_path,
                                "transient request failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(fallback
                                .unwrap_or(HttpError::RetriesExhausted { attempts }))
                        }
                    }
                }
            }
        }
    }

    async fn perform(
        &self,
        route: &CompiledRoute,
        options: &RequestOptions,
    ) -> Result<Attempt, HttpError> {
        let url = route.create_url(&self.config.base_url);
        let mut request = self.client.request(route.method().clone(), &url);
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if !options.no_auth {
            if let Some(token) = &self.config.token {
                request = request.header(header::AUTHORIZATION, token);
            }
        }
        if let Some(reason) = &options.reason {
            request = request.header(AUDIT_LOG_REASON, reason);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, %url, "transport failure");
                return Ok(Attempt::Retry(Some(HttpError::Transport(e))));
            }
        };

        let status = response.status();
        // Every response carries the bucket's current window, successes
        // and failures alike.
        let corrected = self.fold_ratelimit_headers(route, response.headers()).await;

        if status == StatusCode::NO_CONTENT {
            return Ok(Attempt::Done(None));
        }

        if status.is_success() {
            let is_json = content_type(response.headers())
                .is_some_and(|ct| ct.starts_with("application/json"));
            if !is_json {
                return Err(HttpError::UnexpectedBody {
                    content_type: content_type(response.headers())
                        .unwrap_or("<missing>")
                        .to_string(),
                });
            }
            let body = response.json::<Value>().await?;
            return Ok(Attempt::Done(Some(body)));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(self.handle_rate_limit(response, corrected).await);
        }

        let is_json = content_type(response.headers())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let text = response.text().await.unwrap_or_default();
        let message = error_message(&text);

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), %url, "server error");
            return Ok(Attempt::Retry(Some(HttpError::ServerError {
                status: status.as_u16(),
                message,
            })));
        }

        if !is_json {
            // An edge proxy's error page, not an API verdict.
            tracing::warn!(
                status = status.as_u16(),
                "non-JSON error response, treating as transient"
            );
            return Ok(Attempt::Retry(None));
        }

        Err(match status {
            StatusCode::BAD_REQUEST => HttpError::BadRequest { message },
            StatusCode::UNAUTHORIZED => HttpError::Unauthorized { message },
            StatusCode::FORBIDDEN => HttpError::Forbidden { message },
            StatusCode::NOT_FOUND => HttpError::NotFound { message },
            _ => HttpError::ClientError { status: status.as_u16(), message },
        })
    }

    /// `corrected` reports whether the response carried usable
    /// `X-RateLimit-*` headers that were folded into the store.
    async fn handle_rate_limit(&self, response: reqwest::Response, corrected: bool) -> Attempt {
        let text = response.text().await.unwrap_or_default();
        let Ok(body) = serde_json::from_str::<Value>(&text) else {
            // A 429 from an edge proxy rather than the API; the body is
            // not the JSON contract, so treat it as any other hiccup.
            tracing::warn!("non-JSON 429, treating as transient");
            return Attempt::Retry(None);
        };

        if body["global"].as_bool() == Some(true) {
            let retry_after = body["retry_after"].as_f64().unwrap_or(1.0);
            tracing::warn!(retry_after, "globally rate limited");
            self.global.lock(Duration::from_secs_f64(retry_after));
            return Attempt::RateLimited;
        }

        if corrected {
            // The fold above already zeroed the bucket; acquiring it on
            // the next iteration waits out the window.
            tracing::debug!("bucket rate limit hit, re-queueing");
            Attempt::RateLimited
        } else {
            // Without headers the bucket stays unlimited, so re-queueing
            // would resend with zero delay. Spend backoff budget instead;
            // exhaustion then terminates the request.
            tracing::warn!("429 without rate-limit headers, backing off");
            Attempt::Retry(None)
        }
    }

    /// Teach the store this response's bucket. `X-RateLimit-Reset` is
    /// wall-clock epoch seconds; anchoring it against the server's own
    /// `Date` header makes the local deadline immune to clock skew.
    /// Returns false when the headers were absent or unparsable.
    async fn fold_ratelimit_headers(&self, route: &CompiledRoute, headers: &HeaderMap) -> bool {
        let Some(hash) = header_str(headers, "x-ratelimit-bucket") else {
            return false;
        };
        let (Some(limit), Some(remaining), Some(reset)) = (
            header_str(headers, "x-ratelimit-limit").and_then(|v| v.parse::<u32>().ok()),
            header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse::<u32>().ok()),
            header_str(headers, "x-ratelimit-reset").and_then(|v| v.parse::<f64>().ok()),
        ) else {
            return false;
        };

        let server_now = header_str(headers, "date")
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.timestamp_millis() as f64 / 1000.0)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
        let reset_in = (reset - server_now).max(0.0);
        let reset_at = Instant::now() + Duration::from_secs_f64(reset_in);

        self.store.update(route, hash, limit, remaining, reset_at).await;
        true
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "content-type").map(|ct| ct.split(';').next().unwrap_or(ct))
}

/// Pull the API's `message` field out of an error body, falling back to
/// the raw text when it is not the usual JSON shape.
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| text.to_string())
}
