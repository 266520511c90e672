//! Upstream provider client: synchronous and streaming message creation,
//! plus the mapping from upstream failures into the client-facing taxonomy.

use crate::config::Config;
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

fn messages_url(config: &Config) -> String {
    let base = config.upstream_base_url.trim_end_matches('/');
    format!("{base}{MESSAGES_PATH}")
}

async fn post_messages(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = client
        .post(messages_url(config))
        .header("x-api-key", &config.upstream_api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(body)
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {status}: {text}"),
        )
        .with_code(code));
    }
    Ok(resp)
}

/// Synchronous message create; the upstream JSON body is returned as-is.
pub async fn call_messages(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
) -> Result<Value, UpstreamCallError> {
    let resp = post_messages(client, config, body).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })
}

/// Streaming message create; returns the raw response whose byte stream
/// carries the upstream SSE events.
pub async fn call_messages_stream(
    client: &reqwest::Client,
    config: &Config,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    post_messages(client, config, body).await
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    error
        .get("type")
        .or_else(|| error.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Map an upstream failure onto the canonical taxonomy. Gateway-side faults
/// surface as 502 except that upstream 4xx statuses below 500 pass through.
pub fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    match err.kind {
        UpstreamErrorKind::Network => AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            format!("upstream unreachable: {}", err.message),
        ),
        UpstreamErrorKind::Http => {
            let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
            let overloaded = status.as_u16() == 529
                || err.code.as_deref() == Some("overloaded_error");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_auth_error",
                    "upstream rejected the provider credential",
                )
            } else if status == StatusCode::TOO_MANY_REQUESTS {
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "rate_limited",
                    "upstream rate limit reached",
                )
            } else if overloaded {
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "api_overloaded",
                    "upstream is overloaded",
                )
            } else {
                let client_status = if status.as_u16() < 500 {
                    status
                } else {
                    StatusCode::BAD_GATEWAY
                };
                AppError::new(client_status, "upstream_error", err.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16, code: Option<&str>) -> UpstreamCallError {
        UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(StatusCode::from_u16(status).unwrap()),
            code: code.map(str::to_string),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn auth_failures_map_to_upstream_auth_error() {
        for status in [401, 403] {
            let err = upstream_error_to_app(http_err(status, None));
            assert_eq!(err.code, "upstream_auth_error");
            assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn rate_limit_and_overload_have_dedicated_codes() {
        let err = upstream_error_to_app(http_err(429, Some("rate_limit_error")));
        assert_eq!(err.code, "rate_limited");

        let err = upstream_error_to_app(http_err(529, None));
        assert_eq!(err.code, "api_overloaded");

        let err = upstream_error_to_app(http_err(500, Some("overloaded_error")));
        assert_eq!(err.code, "api_overloaded");
    }

    #[test]
    fn client_errors_keep_their_status_server_errors_become_502() {
        let err = upstream_error_to_app(http_err(400, Some("invalid_request_error")));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "upstream_error");

        let err = upstream_error_to_app(http_err(503, None));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn network_failures_are_bad_gateway() {
        let err = upstream_error_to_app(UpstreamCallError {
            kind: UpstreamErrorKind::Network,
            status: None,
            code: None,
            message: "connection refused".to_string(),
        });
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.code, "upstream_error");
    }

    #[test]
    fn error_code_extraction_reads_anthropic_shape() {
        let body = r#"{"error": {"type": "overloaded_error", "message": "busy"}}"#;
        assert_eq!(extract_error_code(body).as_deref(), Some("overloaded_error"));
        assert_eq!(extract_error_code("not json"), None);
    }
}
