//! Shared HTTP plumbing for the platform adapters.
//!
//! Every request goes through the retry engine. Responses are classified
//! into the error taxonomy: 401/403 auth, 404 not found, 429 remote rate
//! limit (with the server's wait), 5xx server error, other 4xx rejected.

use beacon_common::{Error, HttpPolicyConfig, Result};
use beacon_core::retry::{self, Attempt, RetryPolicy};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Sent with every request.
pub const USER_AGENT: &str = concat!("Beacon/", env!("CARGO_PKG_VERSION"));

/// Waits above this are taken to be milliseconds.
const RETRY_AFTER_MS_THRESHOLD: f64 = 1000.0;
const MIN_RETRY_AFTER_S: f64 = 0.1;
/// Longer server waits are clamped to this.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body, `Null` when empty or not JSON.
    pub body: Value,
}

impl ApiResponse {
    /// First present of `keys`, as a string.
    pub fn id_field(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.body.get(*key))
            .find_map(value_to_id)
    }
}

/// String or number JSON value as an id.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// HTTP client bound to one transport's retry policy.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    policy: RetryPolicy,
    transport: &'static str,
}

impl ApiClient {
    pub fn new(transport: &'static str, config: &HttpPolicyConfig) -> Result<Self> {
        let policy = RetryPolicy::from(config);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(policy.timeout)
            .build()
            .map_err(|e| Error::Config(format!("building {transport} HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy,
            transport,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send the request built by `build`, retrying transient failures.
    ///
    /// `build` runs once per attempt.
    pub async fn send<F>(&self, build: F) -> Result<ApiResponse>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let transport = self.transport;
        retry::execute(&self.policy, |attempt| {
            let request = build(&self.client);
            async move {
                tracing::debug!(transport = transport, attempt = attempt + 1, "Sending request");
                Attempt::from_result(send_once(request).await)
            }
        })
        .await
    }
}

async fn send_once(request: RequestBuilder) -> Result<ApiResponse> {
    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.map_err(map_transport_error)?;
    classify(status, &headers, &text)
}

/// Connection-level failures are retryable; anything else is final.
fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        return Error::Config(format!("invalid request: {e}"));
    }
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        return Error::NetworkTimeout(e.to_string());
    }
    if e.is_decode() {
        return Error::decode("response body", e.to_string());
    }
    Error::Rejected {
        status: e.status().map_or(0, |s| s.as_u16()),
        message: e.to_string(),
    }
}

/// Map a response onto success or the error taxonomy.
pub fn classify(status: StatusCode, headers: &HeaderMap, text: &str) -> Result<ApiResponse> {
    let body: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(ApiResponse {
            status: status.as_u16(),
            body,
        });
    }

    let message = error_message(&body, text, status);
    let code = status.as_u16();
    Err(match code {
        401 | 403 => Error::Auth {
            status: code,
            message,
        },
        404 => Error::NotFound(message),
        429 => Error::RateLimitedRemotely {
            retry_after: parse_retry_after(
                headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
                &body,
            ),
            message,
        },
        500..=599 => Error::Server {
            status: code,
            message,
        },
        _ => Error::Rejected {
            status: code,
            message,
        },
    })
}

fn error_message(body: &Value, text: &str, status: StatusCode) -> String {
    for key in ["message", "error", "detail"] {
        if let Some(msg) = body.get(key).and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}", status.as_u16());
    }
    trimmed.chars().take(200).collect()
}

/// Server-requested wait from the `Retry-After` header or a JSON
/// `retry_after` field. Values above 1000 are milliseconds; the floor is 0.1 s
/// and the ceiling one hour.
pub fn parse_retry_after(header: Option<&str>, body: &Value) -> Option<Duration> {
    let from_header = header.and_then(|h| h.trim().parse::<f64>().ok());
    let from_body = || {
        ["retry_after", "Retry-After"]
            .iter()
            .filter_map(|key| body.get(*key))
            .find_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
    };
    let mut seconds = from_header.or_else(from_body)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    if seconds > RETRY_AFTER_MS_THRESHOLD {
        seconds /= 1000.0;
    }
    let wait = Duration::try_from_secs_f64(seconds.max(MIN_RETRY_AFTER_S)).unwrap_or(MAX_RETRY_AFTER);
    Some(wait.min(MAX_RETRY_AFTER))
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Escape one path segment.
pub fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_classify_statuses() {
        let empty = HeaderMap::new();
        assert!(classify(StatusCode::OK, &empty, r#"{"id":"7"}"#).is_ok());
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, &empty, ""),
            Err(Error::Auth { status: 401, .. })
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, &empty, ""),
            Err(Error::Auth { status: 403, .. })
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, &empty, ""),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, &empty, ""),
            Err(Error::Server { status: 503, .. })
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, &empty, ""),
            Err(Error::Rejected { status: 422, .. })
        ));
    }

    #[test]
    fn test_error_message_prefers_json_field() {
        let err = classify(
            StatusCode::BAD_REQUEST,
            &HeaderMap::new(),
            r#"{"message":"title too long"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("title too long"));
    }

    #[test]
    fn test_retry_after_sources() {
        let err = classify(
            StatusCode::TOO_MANY_REQUESTS,
            &headers_with_retry_after("2"),
            "",
        )
        .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let body = json!({"retry_after": 1.5});
        assert_eq!(parse_retry_after(None, &body), Some(Duration::from_millis(1500)));

        let millis = json!({"retry_after": 2500});
        assert_eq!(parse_retry_after(None, &millis), Some(Duration::from_millis(2500)));

        assert_eq!(
            parse_retry_after(Some("0"), &Value::Null),
            Some(Duration::from_millis(100))
        );
        assert_eq!(parse_retry_after(None, &Value::Null), None);
        assert_eq!(parse_retry_after(Some("soon"), &Value::Null), None);
    }

    #[test]
    fn test_huge_retry_after_is_clamped() {
        let err = classify(
            StatusCode::TOO_MANY_REQUESTS,
            &headers_with_retry_after("1e30"),
            "",
        )
        .unwrap_err();
        assert_eq!(err.retry_after(), Some(MAX_RETRY_AFTER));

        let body = json!({"retry_after": 1e300});
        assert_eq!(parse_retry_after(None, &body), Some(MAX_RETRY_AFTER));
        assert_eq!(
            parse_retry_after(Some("7200"), &Value::Null),
            Some(Duration::from_millis(7200))
        );
    }

    #[test]
    fn test_join_url_and_segment() {
        assert_eq!(join_url("https://a.io/", "/api/v1/items"), "https://a.io/api/v1/items");
        assert_eq!(segment("video 1/2"), "video%201%2F2");
    }

    #[test]
    fn test_id_field() {
        let response = ApiResponse {
            status: 200,
            body: json!({"item_id": 42}),
        };
        assert_eq!(response.id_field(&["id", "item_id"]).as_deref(), Some("42"));
    }
}
