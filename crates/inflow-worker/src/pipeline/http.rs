//! Upload HTTP client: thin POST/GET wrappers over `reqwest` with
//! auto-retry status classification, `apilog` persistence, and a dry-run
//! mode for exercising upload pipelines without side effects.
//!
//! Upload functions registered in [`super::registry`] reach out to external
//! destinations through this client rather than building their own
//! `reqwest::Client`, so every outbound call gets consistent logging and
//! error classification regardless of which function invoked it.

use std::collections::BTreeMap;
use std::time::Duration;

use inflow_common::{ErrorCode, PipelineError, Result};
use serde_json::{json, Value};

use crate::db::Store;

/// Default timeout for non-upload external calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for upload requests specifically.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const APILOG_BODY_LIMIT: usize = 500_000;

/// Client wrapping one `reqwest::Client`, the store (for `apilog`), and the
/// dry-run flag read from `API_POST_DRYRUN`.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    store: Store,
    dry_run: bool,
}

impl HttpClient {
    pub fn new(store: Store, dry_run: bool) -> Self {
        Self { client: reqwest::Client::new(), store, dry_run }
    }

    /// Issue a GET request. Not persisted to `apilog` (only non-GET
    /// requests are, per §6).
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e.is_timeout(), e.is_connect(), e.to_string()))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(PipelineError::http(status, format!("GET {url} returned {status}")));
        }
        Ok(decode_body(&text))
    }

    /// Issue a POST request with a JSON body. Always persisted to `apilog`,
    /// whether it succeeds, fails with an HTTP error, or fails to connect
    /// at all; on failure the `apilog` row id is attached to the raised
    /// error. In dry-run mode the request is never issued.
    pub async fn post(&self, url: &str, body: &Value, timeout: Duration) -> Result<Value> {
        if self.dry_run {
            return Ok(json!({ "dryRun": true }));
        }

        let request = json!({
            "method": "POST",
            "url": url,
            "body": body,
            "timeoutSecs": timeout.as_secs(),
        });

        match self.client.post(url).timeout(timeout).json(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = header_map(&response);
                let text = response.text().await.unwrap_or_default();
                let entry = json!({
                    "request": request,
                    "response": { "status": status, "headers": headers, "body": truncate(&text) },
                });
                let log_id = self.store.insert_apilog(&entry).await.ok();
                if !(200..300).contains(&status) {
                    let mut err = PipelineError::http(status, format!("POST {url} returned {status}"));
                    if let Some(id) = log_id {
                        err = err.with_api_log_id(id);
                    }
                    return Err(err);
                }
                Ok(decode_body(&text))
            },
            Err(e) => {
                let entry = json!({
                    "request": request,
                    "response": Value::Null,
                    "exception": e.to_string(),
                });
                let log_id = self.store.insert_apilog(&entry).await.ok();
                let mut err = classify_transport(e.is_timeout(), e.is_connect(), e.to_string());
                if let Some(id) = log_id {
                    err = err.with_api_log_id(id);
                }
                Err(err)
            },
        }
    }
}

fn header_map(response: &reqwest::Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect()
}

fn truncate(body: &str) -> String {
    if body.len() <= APILOG_BODY_LIMIT {
        body.to_string()
    } else {
        body.chars().take(APILOG_BODY_LIMIT).collect()
    }
}

fn decode_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!(text))
}

/// Classify a transport-level failure. DNS-like resolution failures are
/// configuration errors (the URL itself is wrong); everything else that
/// fails to connect is a retriable execution error, same bucket as a
/// timeout.
fn classify_transport(is_timeout: bool, is_connect: bool, message: String) -> PipelineError {
    if is_timeout {
        return PipelineError::timeout(message);
    }
    if is_connect {
        if message.to_ascii_lowercase().contains("dns") {
            return PipelineError::configuration_coded(ErrorCode::OtherConfigurationError, message);
        }
        return PipelineError::connection(message);
    }
    PipelineError::execution(message, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classifies_as_retriable_execution_error() {
        let err = classify_transport(true, false, "operation timed out".to_string());
        assert!(err.auto_retry());
        assert_eq!(err.error_code().to_string(), "TIMEOUT_ERROR");
    }

    #[test]
    fn dns_failure_classifies_as_configuration_error() {
        let err = classify_transport(false, true, "dns error: failed to lookup address".to_string());
        assert!(err.is_file_level());
        assert!(!err.auto_retry());
    }

    #[test]
    fn connection_refused_classifies_as_retriable() {
        let err = classify_transport(false, true, "tcp connect error: connection refused".to_string());
        assert!(!err.is_file_level());
        assert!(err.auto_retry());
    }

    #[test]
    fn body_over_limit_is_truncated() {
        let body = "x".repeat(APILOG_BODY_LIMIT + 10);
        assert_eq!(truncate(&body).len(), APILOG_BODY_LIMIT);
    }

    #[test]
    fn body_under_limit_is_untouched() {
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn non_json_body_decodes_as_string_value() {
        assert_eq!(decode_body("not json"), json!("not json"));
    }

    #[test]
    fn json_body_decodes_structurally() {
        assert_eq!(decode_body(r#"{"ok":true}"#), json!({ "ok": true }));
    }
}
