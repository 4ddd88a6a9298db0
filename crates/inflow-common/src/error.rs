//! Domain error taxonomy for the ingestion pipeline.
//!
//! Every stage (Loader, Parser, Validator, Uploader, Reporter) raises one of
//! exactly three error kinds. The kind determines scope (file vs. record)
//! and default handling; see [`PipelineError`].

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Result type alias for pipeline stage operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Closed set of error codes a [`PipelineError`] may carry.
///
/// HTTP status codes (e.g. `500`) are carried as [`ErrorCode::Http`] rather
/// than enumerated here. Serializes as the bare string form used in
/// `recentErrors`/`log` entries (`"OTHER_VALIDATION_ERROR"`, `"503"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    OtherConfigurationError,
    OtherValidationError,
    OtherExecutionError,
    ConnectionError,
    TimeoutError,
    ErrorcodeUnknown,
    Http(u16),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::OtherConfigurationError => write!(f, "OTHER_CONFIGURATION_ERROR"),
            ErrorCode::OtherValidationError => write!(f, "OTHER_VALIDATION_ERROR"),
            ErrorCode::OtherExecutionError => write!(f, "OTHER_EXECUTION_ERROR"),
            ErrorCode::ConnectionError => write!(f, "CONNECTION_ERROR"),
            ErrorCode::TimeoutError => write!(f, "TIMEOUT_ERROR"),
            ErrorCode::ErrorcodeUnknown => write!(f, "ERRORCODE_UNKNOWN"),
            ErrorCode::Http(status) => write!(f, "{status}"),
        }
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "OTHER_CONFIGURATION_ERROR" => ErrorCode::OtherConfigurationError,
            "OTHER_VALIDATION_ERROR" => ErrorCode::OtherValidationError,
            "OTHER_EXECUTION_ERROR" => ErrorCode::OtherExecutionError,
            "CONNECTION_ERROR" => ErrorCode::ConnectionError,
            "TIMEOUT_ERROR" => ErrorCode::TimeoutError,
            "ERRORCODE_UNKNOWN" => ErrorCode::ErrorcodeUnknown,
            other => ErrorCode::Http(other.parse()?),
        })
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| D::Error::custom(format!("invalid error code: {s}")))
    }
}

/// Auto-retry HTTP statuses and transport failures.
pub const AUTO_RETRY_HTTP_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Three first-class error kinds, each carrying the same metadata shape.
///
/// - `Configuration`: file-level, systemic/fatal. Aborts the stage for the
///   whole file; no further records are processed.
/// - `Validation`: record-level data rejection. The record moves to the
///   stage's error status; the loop continues.
/// - `Execution`: record-level transient failure (timeouts, 5xx). Carries
///   `auto_retry`, consulted by the Uploader's retry-reset path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {summary}")]
    Configuration {
        error_code: ErrorCode,
        summary: String,
        api_log_id: Option<i64>,
    },
    #[error("validation error: {summary}")]
    Validation {
        error_code: ErrorCode,
        summary: String,
        api_log_id: Option<i64>,
    },
    #[error("execution error: {summary}")]
    Execution {
        error_code: ErrorCode,
        summary: String,
        auto_retry: bool,
        http_status: Option<u16>,
        api_log_id: Option<i64>,
    },
}

impl PipelineError {
    pub fn configuration(summary: impl Into<String>) -> Self {
        Self::Configuration {
            error_code: ErrorCode::OtherConfigurationError,
            summary: summary.into(),
            api_log_id: None,
        }
    }

    pub fn configuration_coded(error_code: ErrorCode, summary: impl Into<String>) -> Self {
        Self::Configuration {
            error_code,
            summary: summary.into(),
            api_log_id: None,
        }
    }

    pub fn validation(summary: impl Into<String>) -> Self {
        Self::Validation {
            error_code: ErrorCode::OtherValidationError,
            summary: summary.into(),
            api_log_id: None,
        }
    }

    pub fn validation_coded(error_code: ErrorCode, summary: impl Into<String>) -> Self {
        Self::Validation {
            error_code,
            summary: summary.into(),
            api_log_id: None,
        }
    }

    pub fn execution(summary: impl Into<String>, auto_retry: bool) -> Self {
        Self::Execution {
            error_code: ErrorCode::OtherExecutionError,
            summary: summary.into(),
            auto_retry,
            http_status: None,
            api_log_id: None,
        }
    }

    pub fn timeout(summary: impl Into<String>) -> Self {
        Self::Execution {
            error_code: ErrorCode::TimeoutError,
            summary: summary.into(),
            auto_retry: true,
            http_status: None,
            api_log_id: None,
        }
    }

    /// Transport-level connect failure (refused, reset, unreachable) —
    /// distinct from a DNS-resolution failure, which is a configuration
    /// error since it means the URL itself is wrong.
    pub fn connection(summary: impl Into<String>) -> Self {
        Self::Execution {
            error_code: ErrorCode::ConnectionError,
            summary: summary.into(),
            auto_retry: true,
            http_status: None,
            api_log_id: None,
        }
    }

    pub fn http(status: u16, summary: impl Into<String>) -> Self {
        let auto_retry = AUTO_RETRY_HTTP_STATUSES.contains(&status);
        Self::Execution {
            error_code: ErrorCode::Http(status),
            summary: summary.into(),
            auto_retry,
            http_status: Some(status),
            api_log_id: None,
        }
    }

    pub fn with_api_log_id(mut self, id: i64) -> Self {
        match &mut self {
            Self::Configuration { api_log_id, .. }
            | Self::Validation { api_log_id, .. }
            | Self::Execution { api_log_id, .. } => *api_log_id = Some(id),
        }
        self
    }

    /// Whether this error scopes to the whole file (vs. a single record).
    pub fn is_file_level(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Configuration { error_code, .. }
            | Self::Validation { error_code, .. }
            | Self::Execution { error_code, .. } => *error_code,
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Configuration { summary, .. }
            | Self::Validation { summary, .. }
            | Self::Execution { summary, .. } => summary,
        }
    }

    pub fn auto_retry(&self) -> bool {
        matches!(self, Self::Execution { auto_retry: true, .. })
    }

    pub fn api_log_id(&self) -> Option<i64> {
        match self {
            Self::Configuration { api_log_id, .. }
            | Self::Validation { api_log_id, .. }
            | Self::Execution { api_log_id, .. } => *api_log_id,
        }
    }

    /// Any non-domain exception is folded into a configuration error with
    /// the formatted source chain retained as the summary.
    pub fn from_other(err: &anyhow::Error) -> Self {
        Self::configuration_coded(ErrorCode::ErrorcodeUnknown, format!("{err:#}"))
    }
}
